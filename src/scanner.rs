//! Concurrent filesystem scanner
//!
//! The scanner walks a subtree and dispatches per-file hashing to a
//! worker pool. Traversal itself is serialized (a sorted depth-first
//! walk), which keeps directory-level rules simple: dotfiles are skipped
//! at every level, ignored prefixes mask whole subtrees, and device
//! boundaries and escaping symlinks are reported as they are found.
//!
//! Hashing runs on a rayon pool sized to the configured worker count.
//! Each worker owns its file handle and hash state; results are merged
//! back in input order, so output is deterministic regardless of
//! scheduling. Workers observe a shared cancellation flag between file
//! chunks and abort promptly when it is raised.

use crate::entry::ManifestEntry;
use crate::error::{MantreeError, Result};
use crate::hashing::{self, DigestMap, HashResult};
use crate::verify;
use rayon::prelude::*;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A file discovered by scanning, with its hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Tree-relative path
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Digests computed with the requested hash set
    pub digests: DigestMap,
}

/// One verification work item for the pool
#[derive(Debug)]
pub struct VerifyJob {
    /// Absolute filesystem path
    pub sys_path: PathBuf,
    /// Tree-relative path for reporting
    pub rel_path: String,
    /// Covering entry, if any (strays carry `None`)
    pub entry: Option<ManifestEntry>,
}

/// Result of walking a subtree
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Regular files found, sorted by tree-relative path
    pub files: Vec<String>,
    /// Per-path problems found during traversal (cross-device paths,
    /// escaping symlinks, unreadable directories)
    pub issues: Vec<MantreeError>,
}

/// Reader adapter that observes the cancellation flag between chunks
struct CancellableReader<R> {
    inner: R,
    cancel: Arc<AtomicBool>,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "scan cancelled",
            ));
        }
        self.inner.read(buf)
    }
}

/// Filesystem scanner for a manifest tree
#[derive(Debug)]
pub struct TreeScanner {
    root: PathBuf,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl TreeScanner {
    /// Create a scanner rooted at the manifest tree root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            workers: num_cpus::get(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the worker pool size (minimum 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Shared flag that cancels in-flight hashing when set
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Walk `subtree` (tree-relative, "" for the whole tree)
    ///
    /// Dotfiles and dot-directories are excluded from coverage and
    /// skipped. `ignores` holds tree-relative prefixes (from IGNORE
    /// entries) that mask everything beneath them. When
    /// `expected_device` is set, paths on other filesystems are
    /// reported and their subtrees skipped.
    pub fn walk(
        &self,
        subtree: &str,
        ignores: &[String],
        expected_device: Option<u64>,
    ) -> Result<WalkOutcome> {
        let base = if subtree.is_empty() {
            self.root.clone()
        } else {
            self.root.join(subtree)
        };
        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let mut outcome = WalkOutcome::default();

        let walker = walkdir::WalkDir::new(&base)
            .follow_links(true)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));
        let mut it = walker.into_iter();

        while let Some(item) = it.next() {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    // unreadable directory or symlink loop: report, move on
                    outcome.issues.push(MantreeError::WalkDir(e));
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            let is_dir = entry.file_type().is_dir();
            if name.starts_with('.') {
                trace!(path = ?entry.path(), "skipping dotfile");
                if is_dir {
                    it.skip_current_dir();
                }
                continue;
            }

            let rel_os = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walked path is under the root");
            let rel = match rel_os.to_str() {
                Some(rel) => rel.to_string(),
                None => {
                    outcome.issues.push(MantreeError::InvalidFilename {
                        filename: rel_os.to_string_lossy().into_owned(),
                        position: 0,
                    });
                    if is_dir {
                        it.skip_current_dir();
                    }
                    continue;
                }
            };

            if ignores.iter().any(|ig| crate::pathutil::starts_with(&rel, ig)) {
                trace!(path = %rel, "skipping ignored path");
                if is_dir {
                    it.skip_current_dir();
                }
                continue;
            }

            if let Some(device) = expected_device {
                match device_of(entry.path()) {
                    Ok(dev) if dev != device => {
                        outcome
                            .issues
                            .push(MantreeError::CrossDevice(entry.path().to_path_buf()));
                        if is_dir {
                            it.skip_current_dir();
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        outcome.issues.push(MantreeError::file_io(entry.path(), e));
                        continue;
                    }
                }
            }

            if entry.path_is_symlink() {
                if let Ok(target) = entry.path().canonicalize() {
                    if !target.starts_with(&canonical_root) {
                        warn!(path = %rel, ?target, "symlink escapes the tree");
                        outcome
                            .issues
                            .push(MantreeError::SymlinkEscape(entry.path().to_path_buf()));
                        if is_dir {
                            it.skip_current_dir();
                        }
                        continue;
                    }
                }
            }

            if entry.file_type().is_file() {
                outcome.files.push(rel);
            }
        }

        outcome.files.sort();
        debug!(
            subtree,
            files = outcome.files.len(),
            issues = outcome.issues.len(),
            "walk complete"
        );
        Ok(outcome)
    }

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| {
                MantreeError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                ))
            })
    }

    /// Hash the given files with a fixed hash set on the worker pool
    ///
    /// Input paths are tree-relative; results come back in input order.
    /// Any per-file failure aborts the scan: an unreadable file cannot
    /// produce a manifest entry.
    pub fn scan_files(&self, rel_paths: &[String], hashes: &[String]) -> Result<Vec<ScannedFile>> {
        for name in hashes {
            if !hashing::is_supported(name) {
                return Err(MantreeError::UnsupportedHash(name.clone()));
            }
        }

        let results: Vec<Result<ScannedFile>> = self.pool()?.install(|| {
            rel_paths
                .par_iter()
                .map(|rel| {
                    let result = self.hash_one(rel, hashes)?;
                    Ok(ScannedFile {
                        path: rel.clone(),
                        size: result.size,
                        digests: result.digests,
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn hash_one(&self, rel: &str, hashes: &[String]) -> Result<HashResult> {
        let sys_path = self.root.join(rel);
        let file = File::open(&sys_path).map_err(|e| MantreeError::file_io(&sys_path, e))?;
        let reader = CancellableReader {
            inner: file,
            cancel: Arc::clone(&self.cancel),
        };
        match hashing::hash_reader(reader, hashes) {
            Err(MantreeError::Io(e)) => Err(MantreeError::file_io(&sys_path, e)),
            other => other,
        }
    }

    /// Run per-file verification jobs on the worker pool
    ///
    /// Jobs must arrive sorted by `rel_path`; findings come back in that
    /// order. With `fail_fast` the jobs run serially and the first
    /// failing path ends the run. Backend-level errors (unsupported
    /// hashes) abort either way.
    pub fn verify_files(
        &self,
        jobs: &[VerifyJob],
        fail_fast: bool,
    ) -> Result<Vec<MantreeError>> {
        if fail_fast {
            for job in jobs {
                let failures =
                    verify::verify_path(&job.sys_path, &job.rel_path, job.entry.as_ref())?;
                if !failures.is_empty() {
                    return Ok(failures);
                }
            }
            return Ok(Vec::new());
        }

        let nested: Vec<Result<Vec<MantreeError>>> = self.pool()?.install(|| {
            jobs.par_iter()
                .map(|job| {
                    if self.cancel.load(Ordering::Relaxed) {
                        return Ok(Vec::new());
                    }
                    verify::verify_path(&job.sys_path, &job.rel_path, job.entry.as_ref())
                })
                .collect()
        });

        let mut failures = Vec::new();
        for result in nested {
            failures.extend(result?);
        }
        Ok(failures)
    }
}

#[cfg(unix)]
fn device_of(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(path.symlink_metadata()?.dev())
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> std::io::Result<u64> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sha256(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_walk_sorted_and_dotfiles_skipped() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/sub")).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b/sub/c.txt"), "c").unwrap();
        fs::write(dir.path().join(".dotfile"), "x").unwrap();
        fs::write(dir.path().join(".hidden/inner.txt"), "x").unwrap();

        let scanner = TreeScanner::new(dir.path());
        let outcome = scanner.walk("", &[], None).unwrap();
        assert_eq!(outcome.files, vec!["a.txt", "b/sub/c.txt", "z.txt"]);
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn test_walk_honors_ignores() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();
        fs::create_dir_all(dir.path().join("skip/deep")).unwrap();
        fs::write(dir.path().join("keep/a.txt"), "a").unwrap();
        fs::write(dir.path().join("skip/deep/b.txt"), "b").unwrap();

        let scanner = TreeScanner::new(dir.path());
        let outcome = scanner
            .walk("", &["skip".to_string()], None)
            .unwrap();
        assert_eq!(outcome.files, vec!["keep/a.txt"]);
    }

    #[test]
    fn test_walk_subtree_only() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a/in.txt"), "x").unwrap();
        fs::write(dir.path().join("b/out.txt"), "x").unwrap();

        let scanner = TreeScanner::new(dir.path());
        let outcome = scanner.walk("a", &[], None).unwrap();
        assert_eq!(outcome.files, vec!["a/in.txt"]);
    }

    #[test]
    fn test_scan_files_hashes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f.txt"), b"hello\n").unwrap();

        let scanner = TreeScanner::new(dir.path()).with_workers(2);
        let scanned = scanner
            .scan_files(&["f.txt".to_string()], &sha256(&["SHA256"]))
            .unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].size, 6);
        assert_eq!(
            scanned[0].digests["SHA256"],
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn test_scan_files_unsupported_hash() {
        let dir = TempDir::new().unwrap();
        let scanner = TreeScanner::new(dir.path());
        assert!(matches!(
            scanner.scan_files(&[], &sha256(&["GOST"])),
            Err(MantreeError::UnsupportedHash(_))
        ));
    }

    #[test]
    fn test_cancellation_interrupts_hashing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f.txt"), b"data").unwrap();

        let scanner = TreeScanner::new(dir.path());
        scanner.cancel_flag().store(true, Ordering::Relaxed);
        let result = scanner.scan_files(&["f.txt".to_string()], &sha256(&["SHA256"]));
        assert!(matches!(result, Err(MantreeError::FileIo { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_reported() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("target.txt"), "t").unwrap();
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("target.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let scanner = TreeScanner::new(dir.path());
        let outcome = scanner.walk("", &[], None).unwrap();
        assert!(outcome
            .issues
            .iter()
            .any(|e| matches!(e, MantreeError::SymlinkEscape(_))));
        assert!(outcome.files.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_tree_is_regular() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("target.txt"), "t").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link.txt")).unwrap();

        let scanner = TreeScanner::new(dir.path());
        let outcome = scanner.walk("", &[], None).unwrap();
        assert_eq!(outcome.files, vec!["link.txt", "target.txt"]);
        assert!(outcome.issues.is_empty());
    }
}
