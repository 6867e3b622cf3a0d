//! Manifest file codec
//!
//! A manifest is a line-oriented text file: each non-blank line is one
//! tagged entry (see [`crate::entry`]). The whole file may additionally
//! be wrapped in a single OpenPGP clearsign envelope; this module strips
//! the envelope with a small state machine (including RFC 4880 dash
//! escaping) and hands the signed blob to the OpenPGP envelope for
//! verification.
//!
//! Parsing preserves entry order so that `parse(dump(m)) == m`; mutation
//! paths call [`ManifestFile::canonical_sort`] before writing, which
//! produces the stable on-disk ordering (TIMESTAMP first, then tag
//! groups, then paths).

use crate::compression::{self, CompressionFormat};
use crate::entry::{EntryParseError, EntryTag, FileRef, ManifestEntry};
use crate::error::{MantreeError, Result};
use crate::openpgp::{OpenPgpEnvironment, SignatureData};
use crate::pathutil;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, trace};

const BEGIN_SIGNED: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const BEGIN_SIGNATURE: &str = "-----BEGIN PGP SIGNATURE-----";
const END_SIGNATURE: &str = "-----END PGP SIGNATURE-----";

/// Clearsign parser states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Plain,
    SignedPreamble,
    SignedData,
    Signature,
    PostSigned,
}

/// A single manifest file: ordered entries plus provenance
#[derive(Debug, Clone, Default)]
pub struct ManifestFile {
    /// Entries in file order
    pub entries: Vec<ManifestEntry>,
    /// Whether the file carried a clearsign envelope
    pub signed: bool,
    /// Verified signature metadata, when verification ran
    pub signature: Option<SignatureData>,
    /// Compression used on disk
    pub compression: CompressionFormat,
}

impl ManifestFile {
    /// Create an empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a manifest from disk
    ///
    /// Compression is selected from the path suffix. If `openpgp` is
    /// provided and the file is clearsigned, the signature is verified
    /// and its metadata recorded; with `openpgp` absent the envelope is
    /// stripped without verification.
    pub fn load(disk_path: &Path, openpgp: Option<&OpenPgpEnvironment>) -> Result<ManifestFile> {
        let raw = compression::read_file(disk_path)?;
        let text = String::from_utf8(raw).map_err(|e| {
            MantreeError::syntax(
                disk_path,
                0,
                String::new(),
                format!("not valid UTF-8: {}", e.utf8_error()),
            )
        })?;
        let mut manifest = Self::parse(&text, disk_path, openpgp)?;
        manifest.compression = CompressionFormat::from_path(disk_path);
        Ok(manifest)
    }

    /// Parse manifest text
    ///
    /// `origin` is used for error context only. See [`ManifestFile::load`]
    /// for the `openpgp` semantics.
    pub fn parse(
        text: &str,
        origin: &Path,
        openpgp: Option<&OpenPgpEnvironment>,
    ) -> Result<ManifestFile> {
        let mut manifest = ManifestFile::new();
        let mut state = ParseState::Plain;
        let mut signed_blob = String::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let mut line = raw_line;

            match state {
                ParseState::Plain => {
                    if line == BEGIN_SIGNED {
                        if !manifest.entries.is_empty() {
                            return Err(MantreeError::UnsignedData(origin.to_path_buf()));
                        }
                        signed_blob.push_str(line);
                        signed_blob.push('\n');
                        state = ParseState::SignedPreamble;
                        continue;
                    }
                }
                ParseState::SignedPreamble => {
                    signed_blob.push_str(line);
                    signed_blob.push('\n');
                    // armor headers run until the first empty line
                    if !line.trim().is_empty() {
                        continue;
                    }
                    state = ParseState::SignedData;
                }
                ParseState::SignedData => {
                    signed_blob.push_str(line);
                    signed_blob.push('\n');
                    if line == BEGIN_SIGNATURE {
                        state = ParseState::Signature;
                        continue;
                    }
                    // dash escaping, RFC 4880 says any line can suffer from it
                    if let Some(stripped) = line.strip_prefix("- ") {
                        line = stripped;
                    }
                }
                ParseState::Signature => {
                    signed_blob.push_str(line);
                    signed_blob.push('\n');
                    if line == END_SIGNATURE {
                        state = ParseState::PostSigned;
                    }
                    continue;
                }
                ParseState::PostSigned => {}
            }

            if line.starts_with("-----") && line.trim_end().ends_with("-----") {
                return Err(MantreeError::syntax(
                    origin,
                    line_no,
                    raw_line,
                    "unexpected OpenPGP header",
                ));
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if state == ParseState::PostSigned {
                return Err(MantreeError::UnsignedData(origin.to_path_buf()));
            }

            if fields[0] == "TIMESTAMP" {
                let misplaced = manifest
                    .entries
                    .iter()
                    .any(|e| e.tag() == EntryTag::Timestamp);
                if misplaced {
                    return Err(MantreeError::syntax(
                        origin,
                        line_no,
                        raw_line,
                        "duplicate TIMESTAMP entry",
                    ));
                }
                if !manifest.entries.is_empty() {
                    return Err(MantreeError::syntax(
                        origin,
                        line_no,
                        raw_line,
                        "TIMESTAMP must be the first entry",
                    ));
                }
            }

            match ManifestEntry::from_fields(&fields) {
                Ok(entry) => manifest.entries.push(entry),
                Err(EntryParseError::Malformed(reason)) => {
                    return Err(MantreeError::syntax(origin, line_no, raw_line, reason));
                }
                Err(EntryParseError::Path(e)) => return Err(e),
            }
        }

        match state {
            ParseState::SignedPreamble => {
                return Err(MantreeError::syntax(
                    origin,
                    0,
                    String::new(),
                    "Manifest terminated early, in OpenPGP headers",
                ));
            }
            ParseState::SignedData => {
                return Err(MantreeError::syntax(
                    origin,
                    0,
                    String::new(),
                    "Manifest terminated early, before signature",
                ));
            }
            ParseState::Signature => {
                return Err(MantreeError::syntax(
                    origin,
                    0,
                    String::new(),
                    "Manifest terminated early, inside signature",
                ));
            }
            ParseState::Plain | ParseState::PostSigned => {}
        }

        if state == ParseState::PostSigned {
            manifest.signed = true;
            if let Some(env) = openpgp {
                debug!(?origin, "verifying clearsign envelope");
                manifest.signature = Some(env.verify_clearsigned(signed_blob.as_bytes())?);
            }
        }

        trace!(
            ?origin,
            entries = manifest.entries.len(),
            signed = manifest.signed,
            "parsed manifest"
        );
        Ok(manifest)
    }

    /// Serialize entries into manifest text, preserving entry order
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_fields().join(" "));
            out.push('\n');
        }
        out
    }

    /// Sort entries into the stable on-disk ordering
    ///
    /// TIMESTAMP first, then tag groups in the fixed order, each group
    /// sorted by path. The sort is stable so equal keys keep their
    /// relative order.
    pub fn canonical_sort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.tag()
                .cmp(&b.tag())
                .then_with(|| a.path().unwrap_or("").cmp(b.path().unwrap_or("")))
        });
    }

    /// The TIMESTAMP entry, if present
    pub fn find_timestamp(&self) -> Option<&DateTime<Utc>> {
        self.entries.iter().find_map(|e| match e {
            ManifestEntry::Timestamp(ts) => Some(ts),
            _ => None,
        })
    }

    /// Set or replace the TIMESTAMP entry
    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        for entry in self.entries.iter_mut() {
            if let ManifestEntry::Timestamp(existing) = entry {
                *existing = ts;
                return;
            }
        }
        self.entries.insert(0, ManifestEntry::Timestamp(ts));
    }

    /// Find the entry covering `path` (relative to this manifest's
    /// directory)
    ///
    /// IGNORE entries match recursively; DIST entries never match tree
    /// paths; all other path entries match exactly.
    pub fn find_path_entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| match e {
            ManifestEntry::Ignore { path: ignored } => pathutil::starts_with(path, ignored),
            ManifestEntry::Dist(_) => false,
            other => other.path() == Some(path),
        })
    }

    /// Find the DIST entry for a distfile name
    pub fn find_dist_entry(&self, filename: &str) -> Option<&FileRef> {
        self.entries.iter().find_map(|e| match e {
            ManifestEntry::Dist(f) if f.path == filename => Some(f),
            _ => None,
        })
    }

    /// Iterate over MANIFEST (sub-manifest) references
    pub fn manifest_refs(&self) -> impl Iterator<Item = &FileRef> {
        self.entries.iter().filter_map(|e| match e {
            ManifestEntry::Manifest(f) => Some(f),
            _ => None,
        })
    }
}

impl PartialEq for ManifestFile {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
