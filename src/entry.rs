//! Manifest entry types
//!
//! Every line of a manifest is one tagged entry. Entries are modeled as
//! a sum type with per-tag fields; consumers match exhaustively so new
//! tags cannot be silently ignored.
//!
//! Field grammar per tag:
//!
//! | Tag | Fields |
//! |---|---|
//! | `TIMESTAMP` | ISO-8601 UTC instant |
//! | `MANIFEST`, `DATA`, `MISC`, `EBUILD` | path, size, digest pairs |
//! | `AUX` | path relative to `files/`, size, digest pairs |
//! | `DIST` | filename (no directories), size, digest pairs |
//! | `IGNORE`, `OPTIONAL` | path |
//!
//! Digest pairs alternate `ALGO HEX`; hex is normalized to lowercase on
//! read. Path fields use the `\xNN` escape from [`crate::pathutil`].

use crate::error::MantreeError;
use crate::hashing::DigestMap;
use crate::pathutil;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp format used by TIMESTAMP entries
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Entry tags in canonical write order
///
/// The derived `Ord` is the group order used when a manifest is
/// canonicalized: TIMESTAMP first, then sub-manifest references, then
/// the remaining groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryTag {
    /// Manifest creation time
    Timestamp,
    /// Sub-manifest reference
    Manifest,
    /// Excluded path
    Ignore,
    /// Possibly-absent, unchecked path
    Optional,
    /// Distfile outside the tree
    Dist,
    /// Regular file
    Data,
    /// Non-obligatory file
    Misc,
    /// Ebuild file (DATA with domain semantics)
    Ebuild,
    /// Auxiliary file under `files/` (DATA with implied prefix)
    Aux,
}

impl EntryTag {
    /// The canonical uppercase token for this tag
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryTag::Timestamp => "TIMESTAMP",
            EntryTag::Manifest => "MANIFEST",
            EntryTag::Ignore => "IGNORE",
            EntryTag::Optional => "OPTIONAL",
            EntryTag::Dist => "DIST",
            EntryTag::Data => "DATA",
            EntryTag::Misc => "MISC",
            EntryTag::Ebuild => "EBUILD",
            EntryTag::Aux => "AUX",
        }
    }
}

impl std::fmt::Display for EntryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path, size and digests shared by all checksummed entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Tree-relative path (for DIST: the bare filename)
    pub path: String,
    /// Expected size in bytes
    pub size: u64,
    /// Expected digests, algorithm token to lowercase hex
    pub digests: DigestMap,
}

impl FileRef {
    /// Merge two references for the same path if they are compatible
    ///
    /// Compatible means equal sizes and equal values for every digest
    /// algorithm the two have in common. The merged reference carries
    /// the union of digests. Returns `None` on conflict.
    pub fn merge_compatible(&self, other: &FileRef) -> Option<FileRef> {
        if self.size != other.size {
            return None;
        }
        let mut digests = self.digests.clone();
        for (algo, value) in &other.digests {
            match digests.get(algo) {
                Some(existing) if existing != value => return None,
                _ => {
                    digests.insert(algo.clone(), value.clone());
                }
            }
        }
        Some(FileRef {
            path: self.path.clone(),
            size: self.size,
            digests,
        })
    }
}

/// A single manifest entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    /// Manifest creation time; at most one per manifest, first line
    Timestamp(DateTime<Utc>),
    /// Reference to a sub-manifest file
    Manifest(FileRef),
    /// Path excluded from coverage and verification
    Ignore {
        /// The ignored file or directory
        path: String,
    },
    /// Regular file that must exist with the given content
    Data(FileRef),
    /// As DATA, but absence is not an error
    Misc(FileRef),
    /// File that may be absent; if present it is not checked
    Optional {
        /// The optional path
        path: String,
    },
    /// Distfile looked up in a separate distdir, not the tree
    Dist(FileRef),
    /// Ebuild file; DATA with domain-specific semantics
    Ebuild(FileRef),
    /// Auxiliary file; the stored path carries the implied `files/` prefix
    Aux(FileRef),
}

/// Error produced while decoding a single entry line
///
/// `Malformed` carries only the reason; the codec wraps it with the
/// manifest path, line number and raw line. Path-level problems are
/// already complete [`MantreeError`]s and pass through.
#[derive(Debug)]
pub enum EntryParseError {
    /// The line does not match the tag grammar
    Malformed(String),
    /// The path field is invalid (traversal, bad escape)
    Path(MantreeError),
}

impl From<MantreeError> for EntryParseError {
    fn from(e: MantreeError) -> Self {
        EntryParseError::Path(e)
    }
}

type EntryResult<T> = std::result::Result<T, EntryParseError>;

fn parse_path(tag: &str, field: &str) -> EntryResult<String> {
    let path = pathutil::unescape(field)?;
    if path.is_empty() || path.starts_with('/') {
        return Err(EntryParseError::Malformed(format!(
            "{} line: expected relative path, got: {:?}",
            tag, field
        )));
    }
    let normalized = pathutil::normalize(&path)?;
    if normalized.is_empty() {
        return Err(EntryParseError::Malformed(format!(
            "{} line: path resolves to the tree root: {:?}",
            tag, field
        )));
    }
    Ok(normalized)
}

fn parse_size(tag: &str, field: &str) -> EntryResult<u64> {
    field.parse::<u64>().map_err(|_| {
        EntryParseError::Malformed(format!(
            "{} line: size must be a non-negative integer, got: {:?}",
            tag, field
        ))
    })
}

fn parse_digests(tag: &str, fields: &[&str]) -> EntryResult<DigestMap> {
    let mut digests = DigestMap::new();
    let mut it = fields.iter();
    while let Some(algo) = it.next() {
        let value = it.next().ok_or_else(|| {
            EntryParseError::Malformed(format!("{} line: checksum {} has no value", tag, algo))
        })?;
        if value.len() % 2 != 0 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(EntryParseError::Malformed(format!(
                "{} line: checksum {} has malformed hex value: {:?}",
                tag, algo, value
            )));
        }
        if digests
            .insert(algo.to_string(), value.to_ascii_lowercase())
            .is_some()
        {
            return Err(EntryParseError::Malformed(format!(
                "{} line: duplicate checksum {}",
                tag, algo
            )));
        }
    }
    Ok(digests)
}

fn parse_file_ref(tag: &str, fields: &[&str]) -> EntryResult<FileRef> {
    if fields.len() < 2 {
        return Err(EntryParseError::Malformed(format!(
            "{} line: expects at least 2 values, got: {:?}",
            tag, fields
        )));
    }
    Ok(FileRef {
        path: parse_path(tag, fields[0])?,
        size: parse_size(tag, fields[1])?,
        digests: parse_digests(tag, &fields[2..])?,
    })
}

impl ManifestEntry {
    /// Decode one entry from its whitespace-split fields
    ///
    /// `fields[0]` is the tag; the rest are tag-specific. Unknown tags
    /// are `Malformed`.
    pub fn from_fields(fields: &[&str]) -> EntryResult<ManifestEntry> {
        let tag = fields[0];
        let rest = &fields[1..];
        match tag {
            "TIMESTAMP" => {
                if rest.len() != 1 {
                    return Err(EntryParseError::Malformed(format!(
                        "TIMESTAMP line: expects 1 value, got: {:?}",
                        rest
                    )));
                }
                let naive = NaiveDateTime::parse_from_str(rest[0], TIMESTAMP_FORMAT)
                    .map_err(|_| {
                        EntryParseError::Malformed(format!(
                            "TIMESTAMP line: expected ISO8601 timestamp, got: {:?}",
                            rest[0]
                        ))
                    })?;
                Ok(ManifestEntry::Timestamp(naive.and_utc()))
            }
            "MANIFEST" => Ok(ManifestEntry::Manifest(parse_file_ref(tag, rest)?)),
            "IGNORE" => {
                if rest.len() != 1 {
                    return Err(EntryParseError::Malformed(format!(
                        "IGNORE line: expects 1 value, got: {:?}",
                        rest
                    )));
                }
                Ok(ManifestEntry::Ignore {
                    path: parse_path(tag, rest[0])?,
                })
            }
            "DATA" => Ok(ManifestEntry::Data(parse_file_ref(tag, rest)?)),
            "MISC" => Ok(ManifestEntry::Misc(parse_file_ref(tag, rest)?)),
            "OPTIONAL" => {
                if rest.len() != 1 {
                    return Err(EntryParseError::Malformed(format!(
                        "OPTIONAL line: expects 1 value, got: {:?}",
                        rest
                    )));
                }
                Ok(ManifestEntry::Optional {
                    path: parse_path(tag, rest[0])?,
                })
            }
            "DIST" => {
                let file = parse_file_ref(tag, rest)?;
                if file.path.contains('/') {
                    return Err(EntryParseError::Malformed(format!(
                        "DIST line: file name expected, got directory path: {:?}",
                        file.path
                    )));
                }
                Ok(ManifestEntry::Dist(file))
            }
            "EBUILD" => Ok(ManifestEntry::Ebuild(parse_file_ref(tag, rest)?)),
            "AUX" => {
                let mut file = parse_file_ref(tag, rest)?;
                file.path = pathutil::join("files", &file.path);
                Ok(ManifestEntry::Aux(file))
            }
            other => Err(EntryParseError::Malformed(format!(
                "unknown entry tag: {:?}",
                other
            ))),
        }
    }

    /// Encode this entry into its line fields, path escaped
    pub fn to_fields(&self) -> Vec<String> {
        fn file_fields(tag: EntryTag, file: &FileRef, strip_files: bool) -> Vec<String> {
            let path = if strip_files {
                file.path.strip_prefix("files/").unwrap_or(&file.path)
            } else {
                &file.path
            };
            let mut out = vec![
                tag.as_str().to_string(),
                pathutil::escape(path),
                file.size.to_string(),
            ];
            for (algo, value) in &file.digests {
                out.push(algo.clone());
                out.push(value.clone());
            }
            out
        }

        match self {
            ManifestEntry::Timestamp(ts) => vec![
                "TIMESTAMP".to_string(),
                ts.format(TIMESTAMP_FORMAT).to_string(),
            ],
            ManifestEntry::Manifest(f) => file_fields(EntryTag::Manifest, f, false),
            ManifestEntry::Ignore { path } => {
                vec!["IGNORE".to_string(), pathutil::escape(path)]
            }
            ManifestEntry::Data(f) => file_fields(EntryTag::Data, f, false),
            ManifestEntry::Misc(f) => file_fields(EntryTag::Misc, f, false),
            ManifestEntry::Optional { path } => {
                vec!["OPTIONAL".to_string(), pathutil::escape(path)]
            }
            ManifestEntry::Dist(f) => file_fields(EntryTag::Dist, f, false),
            ManifestEntry::Ebuild(f) => file_fields(EntryTag::Ebuild, f, false),
            ManifestEntry::Aux(f) => file_fields(EntryTag::Aux, f, true),
        }
    }

    /// The tag of this entry
    pub fn tag(&self) -> EntryTag {
        match self {
            ManifestEntry::Timestamp(_) => EntryTag::Timestamp,
            ManifestEntry::Manifest(_) => EntryTag::Manifest,
            ManifestEntry::Ignore { .. } => EntryTag::Ignore,
            ManifestEntry::Data(_) => EntryTag::Data,
            ManifestEntry::Misc(_) => EntryTag::Misc,
            ManifestEntry::Optional { .. } => EntryTag::Optional,
            ManifestEntry::Dist(_) => EntryTag::Dist,
            ManifestEntry::Ebuild(_) => EntryTag::Ebuild,
            ManifestEntry::Aux(_) => EntryTag::Aux,
        }
    }

    /// The path field, if this entry has one
    ///
    /// For AUX the returned path carries the `files/` prefix; for DIST
    /// it is the bare distfile name (not a tree path).
    pub fn path(&self) -> Option<&str> {
        match self {
            ManifestEntry::Timestamp(_) => None,
            ManifestEntry::Manifest(f)
            | ManifestEntry::Data(f)
            | ManifestEntry::Misc(f)
            | ManifestEntry::Dist(f)
            | ManifestEntry::Ebuild(f)
            | ManifestEntry::Aux(f) => Some(&f.path),
            ManifestEntry::Ignore { path } | ManifestEntry::Optional { path } => Some(path),
        }
    }

    /// Shared size/digest data, if this entry carries any
    pub fn file_ref(&self) -> Option<&FileRef> {
        match self {
            ManifestEntry::Manifest(f)
            | ManifestEntry::Data(f)
            | ManifestEntry::Misc(f)
            | ManifestEntry::Dist(f)
            | ManifestEntry::Ebuild(f)
            | ManifestEntry::Aux(f) => Some(f),
            ManifestEntry::Timestamp(_)
            | ManifestEntry::Ignore { .. }
            | ManifestEntry::Optional { .. } => None,
        }
    }

    /// Mutable access to the shared size/digest data
    pub fn file_ref_mut(&mut self) -> Option<&mut FileRef> {
        match self {
            ManifestEntry::Manifest(f)
            | ManifestEntry::Data(f)
            | ManifestEntry::Misc(f)
            | ManifestEntry::Dist(f)
            | ManifestEntry::Ebuild(f)
            | ManifestEntry::Aux(f) => Some(f),
            ManifestEntry::Timestamp(_)
            | ManifestEntry::Ignore { .. }
            | ManifestEntry::Optional { .. } => None,
        }
    }

    /// Whether verification treats absence of the covered file as an error
    pub fn requires_presence(&self) -> bool {
        matches!(
            self,
            ManifestEntry::Manifest(_)
                | ManifestEntry::Data(_)
                | ManifestEntry::Ebuild(_)
                | ManifestEntry::Aux(_)
        )
    }

    /// Construct a checksummed entry of the given tag
    ///
    /// Only DATA-like tags (and MANIFEST/DIST) carry a [`FileRef`];
    /// passing another tag is a programming error.
    pub fn from_file_ref(tag: EntryTag, file: FileRef) -> ManifestEntry {
        match tag {
            EntryTag::Manifest => ManifestEntry::Manifest(file),
            EntryTag::Data => ManifestEntry::Data(file),
            EntryTag::Misc => ManifestEntry::Misc(file),
            EntryTag::Dist => ManifestEntry::Dist(file),
            EntryTag::Ebuild => ManifestEntry::Ebuild(file),
            EntryTag::Aux => ManifestEntry::Aux(file),
            other => unreachable!("tag {} does not carry checksums", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(line: &str) -> Vec<&str> {
        line.split_whitespace().collect()
    }

    #[test]
    fn test_parse_data_entry() {
        let entry = ManifestEntry::from_fields(&fields(
            "DATA a/b.txt 6 SHA256 5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03",
        ))
        .unwrap();
        let file = entry.file_ref().unwrap();
        assert_eq!(entry.tag(), EntryTag::Data);
        assert_eq!(file.path, "a/b.txt");
        assert_eq!(file.size, 6);
        assert_eq!(file.digests.len(), 1);
    }

    #[test]
    fn test_parse_timestamp() {
        let entry = ManifestEntry::from_fields(&fields("TIMESTAMP 2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(
            entry.to_fields(),
            vec!["TIMESTAMP".to_string(), "2024-01-01T00:00:00Z".to_string()]
        );
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        assert!(matches!(
            ManifestEntry::from_fields(&fields("BOGUS a 1")),
            Err(EntryParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_size() {
        assert!(matches!(
            ManifestEntry::from_fields(&fields("DATA a/b -1 SHA256 00")),
            Err(EntryParseError::Malformed(_))
        ));
        assert!(matches!(
            ManifestEntry::from_fields(&fields("DATA a/b x SHA256 00")),
            Err(EntryParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_digest_problems() {
        // odd-length hex
        assert!(ManifestEntry::from_fields(&fields("DATA a/b 1 SHA256 abc")).is_err());
        // missing value
        assert!(ManifestEntry::from_fields(&fields("DATA a/b 1 SHA256")).is_err());
        // duplicated algorithm
        assert!(ManifestEntry::from_fields(&fields("DATA a/b 1 SHA256 00 SHA256 11")).is_err());
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert!(matches!(
            ManifestEntry::from_fields(&fields("DATA ../etc/passwd 0 SHA256 00")),
            Err(EntryParseError::Path(MantreeError::PathTraversal(_)))
        ));
    }

    #[test]
    fn test_dist_rejects_directories() {
        assert!(ManifestEntry::from_fields(&fields("DIST a/b.tar.gz 1 SHA256 00")).is_err());
        assert!(ManifestEntry::from_fields(&fields("DIST b.tar.gz 1 SHA256 00")).is_ok());
    }

    #[test]
    fn test_aux_prefixing() {
        let entry = ManifestEntry::from_fields(&fields("AUX patch.diff 4 SHA256 00ff")).unwrap();
        assert_eq!(entry.path(), Some("files/patch.diff"));
        // the files/ prefix is stripped again on emission
        assert_eq!(
            entry.to_fields(),
            vec!["AUX", "patch.diff", "4", "SHA256", "00ff"]
        );
    }

    #[test]
    fn test_escaped_path_roundtrip() {
        let entry =
            ManifestEntry::from_fields(&fields("DATA a/with\\x20space.txt 1 SHA256 00")).unwrap();
        assert_eq!(entry.path(), Some("a/with space.txt"));
        assert_eq!(entry.to_fields()[1], "a/with\\x20space.txt");
    }

    #[test]
    fn test_digest_hex_lowercased() {
        let entry = ManifestEntry::from_fields(&fields("DATA a/b 1 SHA256 AABB")).unwrap();
        assert_eq!(entry.file_ref().unwrap().digests["SHA256"], "aabb");
    }

    #[test]
    fn test_merge_compatible() {
        let a = FileRef {
            path: "x".into(),
            size: 5,
            digests: DigestMap::from([("SHA256".to_string(), "aa".to_string())]),
        };
        let b = FileRef {
            path: "x".into(),
            size: 5,
            digests: DigestMap::from([
                ("SHA256".to_string(), "aa".to_string()),
                ("SHA512".to_string(), "bb".to_string()),
            ]),
        };
        let merged = a.merge_compatible(&b).unwrap();
        assert_eq!(merged.digests.len(), 2);

        let conflicting = FileRef {
            path: "x".into(),
            size: 5,
            digests: DigestMap::from([("SHA256".to_string(), "cc".to_string())]),
        };
        assert!(a.merge_compatible(&conflicting).is_none());

        let wrong_size = FileRef {
            path: "x".into(),
            size: 6,
            digests: DigestMap::new(),
        };
        assert!(a.merge_compatible(&wrong_size).is_none());
    }
}
