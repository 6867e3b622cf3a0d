//! Top-level manifest discovery
//!
//! Given a directory somewhere inside a manifest tree, walk upwards
//! looking for `Manifest` files. The highest one that still covers the
//! start path wins; the search stops at filesystem boundaries and at
//! the root directory. A parent whose manifest IGNOREs the start path
//! does not cover it, so the search ends below it.

use crate::error::Result;
use crate::manifest::ManifestFile;
use crate::pathutil;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

#[cfg(unix)]
fn file_id(path: &Path) -> std::io::Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_path: &Path) -> std::io::Result<(u64, u64)> {
    Ok((0, 0))
}

/// Find the top-level manifest covering `start`
///
/// Returns the path of the highest `Manifest` whose tree contains
/// `start`, or `None` when no manifest is found. The walk never crosses
/// onto another filesystem.
pub fn find_top_level_manifest(start: &Path) -> Result<Option<PathBuf>> {
    let mut current = start.canonicalize()?;
    let mut last_found: Option<PathBuf> = None;
    let original_device = file_id(&current)?.0;

    loop {
        let (device, inode) = file_id(&current)?;
        if device != original_device {
            break;
        }

        let candidate = current.join("Manifest");
        match ManifestFile::load(&candidate, None) {
            Ok(manifest) => {
                // the relative location of `start` within this tree
                let rel = start
                    .canonicalize()?
                    .strip_prefix(&current)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let ignored = matches!(
                    manifest.find_path_entry(&rel),
                    Some(crate::entry::ManifestEntry::Ignore { .. })
                ) && !rel.is_empty();
                if ignored {
                    trace!(?candidate, rel = %rel, "start path is IGNORE-d here, stopping");
                    break;
                }
                debug!(?candidate, "found covering manifest");
                last_found = Some(candidate);
            }
            Err(e) if e.is_io() => {}
            // a malformed manifest on the way up is still a manifest;
            // surface the problem instead of silently passing it by
            Err(e) => return Err(e),
        }

        let parent = match current.parent() {
            Some(parent) => parent.to_path_buf(),
            None => break,
        };
        if file_id(&parent).map(|id| id == (device, inode)).unwrap_or(true) {
            // reached the filesystem root
            break;
        }
        current = parent;
    }

    Ok(last_found)
}

/// Compute the tree-relative path of `target` under the manifest at
/// `manifest_path`
pub fn subtree_of(manifest_path: &Path, target: &Path) -> Result<String> {
    let root = manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .canonicalize()?;
    let target = target.canonicalize()?;
    let rel = target
        .strip_prefix(&root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    pathutil::normalize(&rel)
}
