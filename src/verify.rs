//! Per-file verification against a single manifest entry
//!
//! The functions here check one filesystem path against the entry that
//! covers it: existence, file type, size (checked first, it is cheap),
//! then digests through the hash multiplexer. They return the full list
//! of findings for the path so callers can aggregate across a tree.
//!
//! Entry semantics:
//!
//! - `IGNORE` always passes.
//! - `OPTIONAL` always passes; the file may be absent, and a present
//!   file is not checked.
//! - `MISC` is checked like `DATA` when present, but absence passes.
//! - `DATA`, `EBUILD`, `AUX` and `MANIFEST` require presence.
//! - A path with no entry fails as a stray when the file exists.

use crate::entry::ManifestEntry;
use crate::error::{MantreeError, Result};
use crate::hashing;
use std::path::Path;
use tracing::trace;

fn file_type_name(meta: &std::fs::Metadata) -> String {
    let ft = meta.file_type();
    if ft.is_dir() {
        "directory".to_string()
    } else if ft.is_file() {
        "regular file".to_string()
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_fifo() {
                return "named pipe".to_string();
            }
            if ft.is_socket() {
                return "UNIX socket".to_string();
            }
            if ft.is_char_device() {
                return "character device".to_string();
            }
            if ft.is_block_device() {
                return "block device".to_string();
            }
        }
        "unknown".to_string()
    }
}

/// Verify one path against its covering entry
///
/// Returns the (possibly empty) list of verification failures for this
/// path. Per-file I/O problems are reported as findings, not hard
/// errors; only backend-level problems (an unsupported hash name in the
/// entry) abort with `Err`, because no path could verify against such an
/// entry.
pub fn verify_path(
    sys_path: &Path,
    rel_path: &str,
    entry: Option<&ManifestEntry>,
) -> Result<Vec<MantreeError>> {
    let file = match entry {
        None => {
            // stray: an error exactly when something is there
            return Ok(if sys_path.symlink_metadata().is_ok() {
                vec![MantreeError::UnexpectedFile(rel_path.to_string())]
            } else {
                Vec::new()
            });
        }
        Some(ManifestEntry::Ignore { .. })
        | Some(ManifestEntry::Optional { .. })
        | Some(ManifestEntry::Timestamp(_)) => return Ok(Vec::new()),
        Some(other) => other.file_ref().expect("remaining entries carry checksums"),
    };
    let entry = entry.expect("checked above");

    // unsupported algorithms fail the whole operation, not just this path
    for algo in file.digests.keys() {
        if !hashing::is_supported(algo) {
            return Err(MantreeError::UnsupportedHash(algo.clone()));
        }
    }

    let meta = match std::fs::metadata(sys_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(if entry.requires_presence() {
                vec![MantreeError::MissingFile(rel_path.to_string())]
            } else {
                Vec::new()
            });
        }
        Err(e) => return Ok(vec![MantreeError::file_io(sys_path, e)]),
    };

    if !meta.is_file() {
        return Ok(vec![MantreeError::FileTypeMismatch {
            path: rel_path.to_string(),
            expected: "regular file".to_string(),
            found: file_type_name(&meta),
        }]);
    }

    // size first; skip hashing when it cannot match anyway (a zero from
    // stat is not trusted, some filesystems report it for non-empty files)
    if meta.len() != 0 && meta.len() != file.size {
        return Ok(vec![MantreeError::SizeMismatch {
            path: rel_path.to_string(),
            expected: file.size,
            got: meta.len(),
        }]);
    }

    let hash_names: Vec<String> = file.digests.keys().cloned().collect();
    trace!(path = rel_path, hashes = ?hash_names, "hashing for verification");
    let result = match hashing::hash_path(sys_path, &hash_names) {
        Ok(result) => result,
        Err(MantreeError::FileIo { path, source }) => {
            return Ok(vec![MantreeError::FileIo { path, source }])
        }
        Err(e) => return Err(e),
    };

    let mut failures = Vec::new();
    if result.size != file.size {
        failures.push(MantreeError::SizeMismatch {
            path: rel_path.to_string(),
            expected: file.size,
            got: result.size,
        });
    }
    for (algo, expected) in &file.digests {
        let got = &result.digests[algo];
        if got != expected {
            failures.push(MantreeError::HashMismatch {
                path: rel_path.to_string(),
                algo: algo.clone(),
                expected: expected.clone(),
                got: got.clone(),
            });
        }
    }
    Ok(failures)
}

/// Verify one path, failing on the first finding
pub fn assert_path_verifies(
    sys_path: &Path,
    rel_path: &str,
    entry: Option<&ManifestEntry>,
) -> Result<()> {
    match verify_path(sys_path, rel_path, entry)?.into_iter().next() {
        None => Ok(()),
        Some(failure) => Err(failure),
    }
}
