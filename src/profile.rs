//! Profile registry
//!
//! A profile bundles the defaults used when creating or updating a
//! manifest tree: which hashes to record, how to compress manifests,
//! when to split a subdirectory into its own sub-manifest, and which tag
//! a file gets from its path. Verification does not need a profile; it
//! follows whatever the loaded manifests contain.
//!
//! The set of profiles is closed: `default`, `ebuild`, `old-ebuild` and
//! `egencache`.

use crate::compression::CompressionFormat;
use crate::entry::EntryTag;
use crate::error::{MantreeError, Result};

/// A named bundle of manifest-generation defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Plain directory tree: everything is DATA, one top-level manifest
    #[default]
    Default,
    /// Modern ebuild repository
    Ebuild,
    /// Ebuild repository keeping Manifest2 compatibility tags
    OldEbuild,
    /// Metadata cache tree written by egencache
    Egencache,
}

impl Profile {
    /// Look up a profile by name
    pub fn by_name(name: &str) -> Result<Profile> {
        match name {
            "default" => Ok(Profile::Default),
            "ebuild" => Ok(Profile::Ebuild),
            "old-ebuild" => Ok(Profile::OldEbuild),
            "egencache" => Ok(Profile::Egencache),
            other => Err(MantreeError::UnknownProfile(other.to_string())),
        }
    }

    /// The profile's name
    pub fn name(&self) -> &'static str {
        match self {
            Profile::Default => "default",
            Profile::Ebuild => "ebuild",
            Profile::OldEbuild => "old-ebuild",
            Profile::Egencache => "egencache",
        }
    }

    /// Hash set recorded for new and updated entries
    pub fn hashes(&self) -> &'static [&'static str] {
        match self {
            Profile::Default => &["SHA256", "SHA512"],
            Profile::Ebuild | Profile::OldEbuild | Profile::Egencache => &["BLAKE2B", "SHA512"],
        }
    }

    /// Default compression for newly written manifests
    pub fn compress_format(&self) -> CompressionFormat {
        match self {
            Profile::Default | Profile::Ebuild | Profile::OldEbuild => CompressionFormat::None,
            Profile::Egencache => CompressionFormat::Gzip,
        }
    }

    /// Minimum serialized size before a manifest is written compressed
    pub fn compress_watermark(&self) -> u64 {
        match self {
            Profile::Default | Profile::Ebuild | Profile::OldEbuild => 4096,
            Profile::Egencache => 128,
        }
    }

    /// Tag assigned to a new file at the given tree-relative path
    pub fn entry_tag_for_path(&self, path: &str) -> EntryTag {
        let components: Vec<&str> = path.split('/').collect();
        match self {
            Profile::Default | Profile::Ebuild | Profile::Egencache => EntryTag::Data,
            Profile::OldEbuild => {
                // category/package/… layout
                if components.len() == 3 {
                    if path.ends_with(".ebuild") {
                        return EntryTag::Ebuild;
                    }
                    if components[2] == "metadata.xml" {
                        return EntryTag::Misc;
                    }
                }
                if components.get(2) == Some(&"files") {
                    return EntryTag::Aux;
                }
                EntryTag::Data
            }
        }
    }

    /// Whether the directory at `dir` gets its own sub-manifest
    ///
    /// `entry_count` is the number of files the directory subtree would
    /// contribute to its parent manifest. The ebuild profiles split at
    /// the package level (`category/package`); the default profile
    /// splits large subtrees by threshold; egencache keeps a single
    /// manifest per top-level cache directory.
    pub fn want_submanifest(&self, dir: &str, entry_count: usize) -> bool {
        if dir.is_empty() {
            return false;
        }
        let depth = dir.split('/').count();
        match self {
            Profile::Default => entry_count >= 512 && depth == 1,
            Profile::Ebuild | Profile::OldEbuild => depth == 2,
            Profile::Egencache => depth == 1,
        }
    }

}

impl std::str::FromStr for Profile {
    type Err = MantreeError;

    fn from_str(s: &str) -> Result<Profile> {
        Profile::by_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_name() {
        assert_eq!(Profile::by_name("default").unwrap(), Profile::Default);
        assert_eq!(Profile::by_name("ebuild").unwrap(), Profile::Ebuild);
        assert_eq!(Profile::by_name("old-ebuild").unwrap(), Profile::OldEbuild);
        assert_eq!(Profile::by_name("egencache").unwrap(), Profile::Egencache);
        assert!(Profile::by_name("nope").is_err());
    }

    #[test]
    fn test_old_ebuild_classification() {
        let p = Profile::OldEbuild;
        assert_eq!(
            p.entry_tag_for_path("dev-util/tool/tool-1.0.ebuild"),
            EntryTag::Ebuild
        );
        assert_eq!(
            p.entry_tag_for_path("dev-util/tool/metadata.xml"),
            EntryTag::Misc
        );
        assert_eq!(
            p.entry_tag_for_path("dev-util/tool/files/fix.patch"),
            EntryTag::Aux
        );
        assert_eq!(p.entry_tag_for_path("profiles/categories"), EntryTag::Data);
        // an .ebuild outside package depth is plain data
        assert_eq!(p.entry_tag_for_path("skel.ebuild"), EntryTag::Data);
    }

    #[test]
    fn test_default_classification() {
        assert_eq!(
            Profile::Default.entry_tag_for_path("dev-util/tool/tool-1.0.ebuild"),
            EntryTag::Data
        );
    }

    #[test]
    fn test_split_policy() {
        assert!(Profile::Ebuild.want_submanifest("dev-util/tool", 3));
        assert!(!Profile::Ebuild.want_submanifest("dev-util", 300));
        assert!(!Profile::Ebuild.want_submanifest("", 3000));
        assert!(Profile::Egencache.want_submanifest("metadata", 1));
        assert!(Profile::Default.want_submanifest("big", 1000));
        assert!(!Profile::Default.want_submanifest("small", 3));
    }
}
