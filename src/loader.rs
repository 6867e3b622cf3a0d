//! Recursive manifest loader and verifier
//!
//! [`ManifestLoader`] owns the loaded-manifest graph for one tree: it
//! loads chains of manifest files on demand, verifies each sub-manifest
//! against its parent's digests before trusting it, resolves which
//! manifest authoritatively covers each path, and drives whole-tree
//! verification, update and creation.
//!
//! ## Trust model
//!
//! The top-level manifest is the root of trust; it may be OpenPGP
//! clearsigned, in which case the signature is verified on load. Every
//! sub-manifest must match the size and digests its parent records for
//! it before being parsed; a mismatch breaks the chain and the
//! sub-manifest is unusable.
//!
//! ## Lazy loading
//!
//! [`load_manifests_for_path`] loads only the chain needed to cover one
//! path; every operation funnels through it, so single-file
//! verification of a leaf never parses unrelated branches.
//!
//! ## Coverage
//!
//! The coverage index maps each tree-relative path to the single entry
//! that governs it. Entries for the same path from different manifests
//! are merged when they agree (same size, no conflicting digests);
//! disagreement is a [`MantreeError::DuplicateCoverage`] error. IGNORE
//! entries mask entire subtrees and dominate every other entry kind.
//!
//! [`load_manifests_for_path`]: ManifestLoader::load_manifests_for_path

use crate::compression::{self, CompressionFormat};
use crate::entry::{FileRef, ManifestEntry};
use crate::error::{MantreeError, Result};
use crate::hashing::{self, DigestMap};
use crate::manifest::ManifestFile;
use crate::openpgp::OpenPgpEnvironment;
use crate::pathutil;
use crate::profile::Profile;
use crate::scanner::{TreeScanner, VerifyJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Options for directory verification
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Stop at the first failing path instead of collecting everything
    pub fail_fast: bool,
    /// When false, mismatches on MISC entries are downgraded to warnings
    pub strict: bool,
    /// Maximum permitted age of the TIMESTAMP entry, in seconds
    pub max_timestamp_age: Option<u64>,
    /// Verify DIST entries against files in this directory
    pub distdir: Option<PathBuf>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            strict: true,
            max_timestamp_age: None,
            distdir: None,
        }
    }
}

/// Options for tree update
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Skip rehashing files whose mtime predates this instant and whose
    /// size is unchanged (incremental update against the previous
    /// TIMESTAMP)
    pub incremental_since: Option<DateTime<Utc>>,
}

/// Summary of an update operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStats {
    /// Files seen in the scanned subtree
    pub files_scanned: usize,
    /// Files hashed (smaller than `files_scanned` on incremental runs)
    pub files_hashed: usize,
    /// Entries newly added
    pub entries_added: usize,
    /// Entries whose size or digests changed
    pub entries_updated: usize,
    /// Entries removed for vanished files
    pub entries_removed: usize,
}

/// Summary of a save operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveStats {
    /// Manifest files rewritten
    pub manifests_written: usize,
    /// Whether the top-level manifest was clearsigned
    pub signed: bool,
}

/// Derived coverage over every loaded manifest
#[derive(Debug, Default)]
pub struct CoverageIndex {
    /// Tree-relative path to (owning manifest, authoritative entry)
    entries: BTreeMap<String, (String, ManifestEntry)>,
    /// Tree-relative IGNORE prefixes
    ignores: Vec<String>,
}

/// Result of a coverage lookup
#[derive(Debug)]
pub enum Coverage<'a> {
    /// Path is masked by an IGNORE entry
    Ignored,
    /// Path is governed by this entry from this manifest
    Covered(&'a str, &'a ManifestEntry),
    /// No loaded manifest covers the path
    Stray,
}

impl CoverageIndex {
    /// Look up the authoritative coverage of a path
    pub fn lookup(&self, path: &str) -> Coverage<'_> {
        // IGNORE is strictly stronger than any other entry kind
        if self
            .ignores
            .iter()
            .any(|ig| pathutil::starts_with(path, ig))
        {
            return Coverage::Ignored;
        }
        match self.entries.get(path) {
            Some((manifest, entry)) => Coverage::Covered(manifest, entry),
            None => Coverage::Stray,
        }
    }

    /// The IGNORE prefixes, for walkers
    pub fn ignores(&self) -> &[String] {
        &self.ignores
    }

    /// Iterate over all covered paths
    pub fn iter(&self) -> impl Iterator<Item = (&String, &(String, ManifestEntry))> {
        self.entries.iter()
    }
}

// RAII reset for the update-in-progress flag
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Builder for [`ManifestLoader`]
///
/// ```rust,no_run
/// use mantree::loader::ManifestLoaderBuilder;
/// use mantree::profile::Profile;
/// use std::path::Path;
///
/// # fn main() -> mantree::Result<()> {
/// let mut loader = ManifestLoaderBuilder::new()
///     .profile(Profile::Default)
///     .hashes(vec!["SHA256".to_string()])
///     .build(Path::new("tree/Manifest"))?;
/// loader.assert_directory_verifies("", &Default::default())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ManifestLoaderBuilder {
    verify_openpgp: Option<bool>,
    require_signed: bool,
    allow_create: bool,
    profile: Profile,
    hashes: Option<Vec<String>>,
    compress_format: Option<CompressionFormat>,
    compress_watermark: Option<u64>,
    sign: Option<bool>,
    openpgp_key_id: Option<String>,
    workers: Option<usize>,
    openpgp: Option<OpenPgpEnvironment>,
}

impl ManifestLoaderBuilder {
    /// Create a builder with profile defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable OpenPGP verification of signed manifests
    /// (default: enabled)
    pub fn verify_openpgp(mut self, verify: bool) -> Self {
        self.verify_openpgp = Some(verify);
        self
    }

    /// Require the top-level manifest to be signed
    pub fn require_signed(mut self, require: bool) -> Self {
        self.require_signed = require;
        self
    }

    /// Allow a missing top-level manifest (for `create`)
    pub fn allow_create(mut self, allow: bool) -> Self {
        self.allow_create = allow;
        self
    }

    /// Select the profile supplying hash/compression/tagging defaults
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Override the profile's hash set
    pub fn hashes(mut self, hashes: Vec<String>) -> Self {
        self.hashes = Some(hashes);
        self
    }

    /// Override the profile's compression format for new manifests
    pub fn compress_format(mut self, format: CompressionFormat) -> Self {
        self.compress_format = Some(format);
        self
    }

    /// Override the profile's compression watermark
    pub fn compress_watermark(mut self, watermark: u64) -> Self {
        self.compress_watermark = Some(watermark);
        self
    }

    /// Force signing on (`Some(true)`), off (`Some(false)`), or keep the
    /// previous signed state (`None`, the default)
    pub fn sign(mut self, sign: Option<bool>) -> Self {
        self.sign = sign;
        self
    }

    /// Key id passed to the signing tool
    pub fn openpgp_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.openpgp_key_id = Some(key_id.into());
        self
    }

    /// Worker pool size for scanning and hashing
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Use a specific OpenPGP environment (e.g. an isolated one with
    /// explicitly imported keys)
    pub fn openpgp_env(mut self, env: OpenPgpEnvironment) -> Self {
        self.openpgp = Some(env);
        self
    }

    /// Build the loader and load the top-level manifest
    pub fn build(self, top_manifest_path: &Path) -> Result<ManifestLoader> {
        let root = top_manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let top_name = top_manifest_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("Manifest")
            .to_string();

        let verify_openpgp = self.verify_openpgp.unwrap_or(true);
        let openpgp = match self.openpgp {
            Some(env) => Some(env),
            None if verify_openpgp => Some(OpenPgpEnvironment::system()),
            None => None,
        };

        let mut scanner = TreeScanner::new(root.clone());
        if let Some(workers) = self.workers {
            scanner = scanner.with_workers(workers);
        }

        let profile = self.profile;
        let hashes = self
            .hashes
            .unwrap_or_else(|| profile.hashes().iter().map(|s| s.to_string()).collect());
        let compress_format = self
            .compress_format
            .unwrap_or_else(|| profile.compress_format());
        let compress_watermark = self
            .compress_watermark
            .unwrap_or_else(|| profile.compress_watermark());

        let mut loader = ManifestLoader {
            root,
            top_name: top_name.clone(),
            manifests: BTreeMap::new(),
            parents: HashMap::new(),
            dirty: BTreeSet::new(),
            manifest_device: None,
            openpgp,
            verify_openpgp,
            profile,
            hashes,
            compress_format,
            compress_watermark,
            sign: self.sign,
            openpgp_key_id: self.openpgp_key_id,
            scanner,
            updating: Arc::new(AtomicBool::new(false)),
        };

        if top_manifest_path.exists() {
            loader.load_manifest(&top_name, None)?;
        } else if self.allow_create {
            debug!(?top_manifest_path, "starting a fresh manifest tree");
            loader
                .manifests
                .insert(top_name.clone(), ManifestFile::new());
            loader.dirty.insert(top_name);
        } else {
            return Err(MantreeError::file_io(
                top_manifest_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no top-level Manifest"),
            ));
        }

        if self.require_signed {
            let top = &loader.manifests[&loader.top_name];
            if !top.signed {
                return Err(MantreeError::OpenPgpNoSignature(
                    top_manifest_path.to_path_buf(),
                ));
            }
        }

        Ok(loader)
    }
}

/// A tree covered by multiple manifests
///
/// See the module documentation for the trust and coverage model. The
/// loader is the single coordinator: manifest I/O and index maintenance
/// happen here, on the calling thread; only per-file hashing runs on
/// the scanner's worker pool.
#[derive(Debug)]
pub struct ManifestLoader {
    root: PathBuf,
    top_name: String,
    manifests: BTreeMap<String, ManifestFile>,
    // child manifest -> referencing parent manifest
    parents: HashMap<String, String>,
    dirty: BTreeSet<String>,
    manifest_device: Option<u64>,
    openpgp: Option<OpenPgpEnvironment>,
    verify_openpgp: bool,
    profile: Profile,
    hashes: Vec<String>,
    compress_format: CompressionFormat,
    compress_watermark: u64,
    sign: Option<bool>,
    openpgp_key_id: Option<String>,
    scanner: TreeScanner,
    updating: Arc<AtomicBool>,
}

impl ManifestLoader {
    /// Start building a loader
    pub fn builder() -> ManifestLoaderBuilder {
        ManifestLoaderBuilder::new()
    }

    /// The tree root directory (the top-level manifest's directory)
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The top-level manifest, always loaded
    pub fn top_manifest(&self) -> &ManifestFile {
        &self.manifests[&self.top_name]
    }

    /// Relative paths of all currently loaded manifests
    pub fn loaded_manifests(&self) -> impl Iterator<Item = &String> {
        self.manifests.keys()
    }

    /// The hash set used for new and updated entries
    pub fn hashes(&self) -> &[String] {
        &self.hashes
    }

    fn openpgp_for_load(&self) -> Option<&OpenPgpEnvironment> {
        if self.verify_openpgp {
            self.openpgp.as_ref()
        } else {
            None
        }
    }

    /// Load a single manifest by tree-relative path
    ///
    /// With `verify_entry` set, the on-disk file is first checked
    /// against the parent's size and digests; failure breaks the trust
    /// chain with [`MantreeError::InvalidSubManifest`].
    fn load_manifest(&mut self, relpath: &str, verify_entry: Option<(&FileRef, &str)>) -> Result<()> {
        let disk_path = self.root.join(relpath);

        if let Some((file, parent)) = verify_entry {
            let hash_names: Vec<String> = file.digests.keys().cloned().collect();
            let result = hashing::hash_path(&disk_path, &hash_names).map_err(|e| match e {
                MantreeError::FileIo { .. } => MantreeError::InvalidSubManifest {
                    parent: parent.to_string(),
                    child: relpath.to_string(),
                },
                other => other,
            })?;
            let matches = result.size == file.size
                && file
                    .digests
                    .iter()
                    .all(|(algo, value)| result.digests.get(algo) == Some(value));
            if !matches {
                return Err(MantreeError::InvalidSubManifest {
                    parent: parent.to_string(),
                    child: relpath.to_string(),
                });
            }
        }

        let manifest = ManifestFile::load(&disk_path, self.openpgp_for_load())?;
        if self.manifest_device.is_none() {
            self.manifest_device = device_of(&disk_path).ok();
        }
        debug!(
            relpath,
            entries = manifest.entries.len(),
            signed = manifest.signed,
            "loaded manifest"
        );
        self.manifests.insert(relpath.to_string(), manifest);
        Ok(())
    }

    fn is_ancestor_manifest(&self, candidate: &str, of: &str) -> bool {
        let mut current = of;
        while let Some(parent) = self.parents.get(current) {
            if parent == candidate {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Load every manifest whose coverage can reach `path`
    ///
    /// With `recursive` also loads manifests for subdirectories of
    /// `path`, which directory-wide operations need. All operations
    /// funnel through here, so only the needed chain is ever parsed.
    pub fn load_manifests_for_path(&mut self, path: &str, recursive: bool) -> Result<()> {
        loop {
            let mut to_load: Vec<(String, FileRef, String)> = Vec::new();
            for (name, manifest) in &self.manifests {
                let dir = pathutil::parent_dir(name);
                let applies = pathutil::starts_with(path, dir)
                    || (recursive && pathutil::starts_with(dir, path));
                if !applies {
                    continue;
                }
                for file in manifest.manifest_refs() {
                    let target = pathutil::join(dir, &file.path);
                    if target == *name || self.is_ancestor_manifest(&target, name) {
                        return Err(MantreeError::ManifestCycle(target));
                    }
                    if self.manifests.contains_key(&target) {
                        continue;
                    }
                    let target_dir = pathutil::parent_dir(&target);
                    let wanted = pathutil::starts_with(path, target_dir)
                        || (recursive && pathutil::starts_with(target_dir, path));
                    if wanted && !to_load.iter().any(|(t, _, _)| t == &target) {
                        to_load.push((target, file.clone(), name.clone()));
                    }
                }
            }
            if to_load.is_empty() {
                return Ok(());
            }
            for (target, file, parent) in to_load {
                trace!(manifest = %target, parent = %parent, "loading sub-manifest");
                self.load_manifest(&target, Some((&file, &parent)))?;
                self.parents.insert(target, parent);
            }
        }
    }

    /// Build the coverage index over all loaded manifests
    ///
    /// Only paths within `scope` are included. Colliding entries are
    /// merged when compatible; conflicts fail with
    /// [`MantreeError::DuplicateCoverage`].
    pub fn build_coverage(&self, scope: &str) -> Result<CoverageIndex> {
        let mut index = CoverageIndex::default();
        for (name, manifest) in &self.manifests {
            let dir = pathutil::parent_dir(name);
            for entry in &manifest.entries {
                match entry {
                    ManifestEntry::Timestamp(_) | ManifestEntry::Dist(_) => continue,
                    ManifestEntry::Ignore { path } => {
                        index.ignores.push(pathutil::join(dir, path));
                        continue;
                    }
                    _ => {}
                }
                let path = entry.path().expect("remaining entries carry paths");
                let full = pathutil::join(dir, path);
                if !pathutil::starts_with(&full, scope) {
                    continue;
                }

                match index.entries.get_mut(&full) {
                    None => {
                        index.entries.insert(full, (name.clone(), entry.clone()));
                    }
                    Some((existing_manifest, existing)) => {
                        let merged = merge_entries(existing, entry);
                        match merged {
                            Some(merged) => *existing = merged,
                            None => {
                                return Err(MantreeError::DuplicateCoverage {
                                    path: full,
                                    manifest_a: existing_manifest.clone(),
                                    manifest_b: name.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(index)
    }

    /// Find the entry covering `path`, loading manifests as needed
    ///
    /// Returns the merged authoritative entry, an IGNORE entry when the
    /// path is masked, or `None` for strays. DIST entries never cover
    /// tree paths.
    pub fn find_path_entry(&mut self, path: &str) -> Result<Option<ManifestEntry>> {
        let path = pathutil::normalize(path)?;
        self.load_manifests_for_path(&path, false)?;

        let mut found: Option<(String, ManifestEntry)> = None;
        for (name, manifest) in &self.manifests {
            let dir = pathutil::parent_dir(name);
            if !pathutil::starts_with(&path, dir) {
                continue;
            }
            let rel = if dir.is_empty() {
                path.clone()
            } else if path.len() > dir.len() {
                path[dir.len() + 1..].to_string()
            } else {
                // the path is this manifest's own directory
                continue;
            };
            if let Some(entry) = manifest.find_path_entry(&rel) {
                if matches!(entry, ManifestEntry::Ignore { .. }) {
                    return Ok(Some(entry.clone()));
                }
                match &mut found {
                    None => found = Some((name.clone(), entry.clone())),
                    Some((first_manifest, existing)) => match merge_entries(existing, entry) {
                        Some(merged) => *existing = merged,
                        None => {
                            return Err(MantreeError::DuplicateCoverage {
                                path,
                                manifest_a: first_manifest.clone(),
                                manifest_b: name.clone(),
                            })
                        }
                    },
                }
            }
        }
        Ok(found.map(|(_, entry)| entry))
    }

    /// Find a DIST entry by distfile name
    ///
    /// `context` narrows the search to manifests applying to that
    /// directory (e.g. a package directory); pass "" to search from the
    /// top.
    pub fn find_dist_entry(&mut self, filename: &str, context: &str) -> Result<Option<FileRef>> {
        self.load_manifests_for_path(context, false)?;
        for (name, manifest) in &self.manifests {
            let dir = pathutil::parent_dir(name);
            if !pathutil::starts_with(context, dir) {
                continue;
            }
            if let Some(file) = manifest.find_dist_entry(filename) {
                return Ok(Some(file.clone()));
            }
        }
        Ok(None)
    }

    /// The top-level TIMESTAMP entry, if any
    pub fn find_timestamp(&self) -> Option<DateTime<Utc>> {
        self.top_manifest().find_timestamp().copied()
    }

    /// Set the top-level TIMESTAMP entry
    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        let top = self.top_name.clone();
        self.manifests
            .get_mut(&top)
            .expect("top manifest is always loaded")
            .set_timestamp(ts);
        self.dirty.insert(top);
    }

    /// Verify a single path against its covering entry
    ///
    /// Loads only the manifest chain needed to cover the path. A path
    /// with no entry fails as a stray.
    pub fn assert_path_verifies(&mut self, path: &str) -> Result<()> {
        let path = pathutil::normalize(path)?;
        let entry = self.find_path_entry(&path)?;
        let sys_path = self.root.join(&path);
        crate::verify::assert_path_verifies(&sys_path, &path, entry.as_ref())
    }

    /// Verify the whole subtree under `subtree` ("" for the full tree)
    ///
    /// Walks the filesystem, resolves coverage for every path, checks
    /// sizes and hashes on the worker pool, and reports strays and
    /// missing files. By default all failures are collected and
    /// returned in one [`MantreeError::VerificationFailed`]; see
    /// [`VerifyOptions::fail_fast`].
    pub fn assert_directory_verifies(
        &mut self,
        subtree: &str,
        options: &VerifyOptions,
    ) -> Result<()> {
        let subtree = pathutil::normalize(subtree)?;
        self.load_manifests_for_path(&subtree, true)?;
        let coverage = self.build_coverage(&subtree)?;

        let mut failures: Vec<MantreeError> = Vec::new();

        if let Some(max_age) = options.max_timestamp_age {
            if let Some(ts) = self.find_timestamp() {
                let age = Utc::now().signed_duration_since(ts);
                if age.num_seconds() < 0 || age.num_seconds() as u64 > max_age {
                    failures.push(MantreeError::StaleTimestamp {
                        timestamp: ts.to_rfc3339(),
                        max_age_secs: max_age,
                    });
                }
            }
        }

        let outcome = self
            .scanner
            .walk(&subtree, coverage.ignores(), self.manifest_device)?;
        failures.extend(outcome.issues);

        let mut misc_paths: BTreeSet<String> = BTreeSet::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut jobs: Vec<VerifyJob> = Vec::new();

        for file in &outcome.files {
            // the top-level manifest cannot cover itself
            if *file == self.top_name {
                continue;
            }
            match coverage.lookup(file) {
                Coverage::Ignored => {}
                Coverage::Covered(_, entry) => {
                    seen.insert(file.as_str());
                    if matches!(entry, ManifestEntry::Misc(_)) {
                        misc_paths.insert(file.clone());
                    }
                    jobs.push(VerifyJob {
                        sys_path: self.root.join(file),
                        rel_path: file.clone(),
                        entry: Some(entry.clone()),
                    });
                }
                Coverage::Stray => {
                    jobs.push(VerifyJob {
                        sys_path: self.root.join(file),
                        rel_path: file.clone(),
                        entry: None,
                    });
                }
            }
        }

        // entries whose files the walk did not see: missing, or hidden
        // behind the dotfile rule; verify them directly either way
        for (path, (_, entry)) in coverage.iter() {
            if seen.contains(path.as_str()) {
                continue;
            }
            if matches!(entry, ManifestEntry::Misc(_)) {
                misc_paths.insert(path.clone());
            }
            jobs.push(VerifyJob {
                sys_path: self.root.join(path),
                rel_path: path.clone(),
                entry: Some(entry.clone()),
            });
        }

        if let Some(distdir) = &options.distdir {
            for job in self.dist_jobs(&subtree, distdir) {
                jobs.push(job);
            }
        }

        jobs.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        failures.extend(self.scanner.verify_files(&jobs, options.fail_fast)?);

        if !options.strict {
            failures.retain(|failure| match failure_path(failure) {
                Some(path) if misc_paths.contains(path) => {
                    warn!(path = %path, "ignoring MISC mismatch (non-strict mode)");
                    false
                }
                _ => true,
            });
        }

        if failures.is_empty() {
            info!(subtree = %subtree, "directory verifies");
            Ok(())
        } else {
            Err(MantreeError::VerificationFailed { failures })
        }
    }

    fn dist_jobs(&self, scope: &str, distdir: &Path) -> Vec<VerifyJob> {
        let mut jobs = Vec::new();
        let mut names: BTreeSet<String> = BTreeSet::new();
        for (name, manifest) in &self.manifests {
            let dir = pathutil::parent_dir(name);
            let applies =
                pathutil::starts_with(scope, dir) || pathutil::starts_with(dir, scope);
            if !applies {
                continue;
            }
            for entry in &manifest.entries {
                if let ManifestEntry::Dist(file) = entry {
                    if !names.insert(file.path.clone()) {
                        continue;
                    }
                    let sys_path = distdir.join(&file.path);
                    // distfiles are fetched on demand; only check what is there
                    if sys_path.exists() {
                        jobs.push(VerifyJob {
                            sys_path,
                            rel_path: file.path.clone(),
                            entry: Some(entry.clone()),
                        });
                    }
                }
            }
        }
        jobs
    }

    /// Update manifest entries for a subtree to match the filesystem
    ///
    /// Scans the subtree, rehashes files, updates or adds entries with
    /// tags from the profile, and drops entries for vanished files.
    /// IGNORE, OPTIONAL and DIST entries are preserved verbatim. New
    /// sub-manifests are emitted where the profile's split policy calls
    /// for them. Call [`save_manifests`] afterwards to write the result.
    ///
    /// A second concurrent update is refused with
    /// [`MantreeError::Busy`].
    ///
    /// [`save_manifests`]: ManifestLoader::save_manifests
    pub fn update_entries_for_directory(
        &mut self,
        subtree: &str,
        options: &UpdateOptions,
    ) -> Result<UpdateStats> {
        if self.updating.swap(true, Ordering::Acquire) {
            return Err(MantreeError::Busy(format!(
                "another update is already running over {:?}",
                subtree
            )));
        }
        let _busy = BusyGuard(Arc::clone(&self.updating));

        let subtree = pathutil::normalize(subtree)?;
        self.load_manifests_for_path(&subtree, true)?;
        let coverage = self.build_coverage(&subtree)?;

        let outcome = self
            .scanner
            .walk(&subtree, coverage.ignores(), self.manifest_device)?;
        if let Some(issue) = outcome.issues.into_iter().next() {
            // an update cannot proceed over a tree it cannot fully see
            return Err(issue);
        }

        let mut stats = UpdateStats::default();

        // manifest files are covered through MANIFEST entries, never DATA
        let files: Vec<String> = outcome
            .files
            .into_iter()
            .filter(|f| *f != self.top_name && !is_manifest_name(f))
            .collect();
        stats.files_scanned = files.len();

        // incremental: keep entries for files older than the cutoff
        let mut to_hash: Vec<String> = Vec::new();
        let mut decided: BTreeMap<String, FileRef> = BTreeMap::new();
        for file in files {
            if let Coverage::Covered(_, entry) = coverage.lookup(&file) {
                // OPTIONAL paths stay unchecksummed even when present
                if matches!(entry, ManifestEntry::Optional { .. }) {
                    continue;
                }
                if let (Some(since), Some(existing)) =
                    (options.incremental_since, entry.file_ref())
                {
                    if file_unchanged_since(&self.root.join(&file), existing.size, since) {
                        decided.insert(file, existing.clone());
                        continue;
                    }
                }
            }
            to_hash.push(file);
        }
        stats.files_hashed = to_hash.len();

        for scanned in self.scanner.scan_files(&to_hash, &self.hashes)? {
            decided.insert(
                scanned.path.clone(),
                FileRef {
                    path: scanned.path,
                    size: scanned.size,
                    digests: scanned.digests,
                },
            );
        }

        self.emit_submanifests(&subtree, &decided)?;

        // assign every file to the deepest manifest covering it
        let mut assignments: BTreeMap<String, Vec<(String, FileRef)>> = BTreeMap::new();
        for (path, file) in decided {
            let target = self.covering_manifest(&path);
            assignments.entry(target).or_default().push((path, file));
        }

        // rewrite the path entries of every manifest in scope
        let manifest_names: Vec<String> = self.manifests.keys().cloned().collect();
        for name in manifest_names {
            let dir = pathutil::parent_dir(&name).to_string();
            let assigned: BTreeMap<String, FileRef> = assignments
                .remove(&name)
                .unwrap_or_default()
                .into_iter()
                .collect();
            let manifest = self.manifests.get_mut(&name).expect("key from map");

            let mut changed = false;
            let mut kept: Vec<ManifestEntry> = Vec::with_capacity(manifest.entries.len());
            let mut handled: BTreeSet<String> = BTreeSet::new();

            for entry in manifest.entries.drain(..) {
                let keep_verbatim = matches!(
                    entry,
                    ManifestEntry::Timestamp(_)
                        | ManifestEntry::Ignore { .. }
                        | ManifestEntry::Optional { .. }
                        | ManifestEntry::Dist(_)
                        | ManifestEntry::Manifest(_)
                );
                if keep_verbatim {
                    kept.push(entry);
                    continue;
                }

                let rel = entry.path().expect("file entries carry paths");
                let full = pathutil::join(&dir, rel);
                if !pathutil::starts_with(&full, &subtree) {
                    // outside the updated scope, leave untouched
                    kept.push(entry);
                    continue;
                }
                match assigned.get(&full) {
                    Some(file) => {
                        handled.insert(full.clone());
                        let new_ref = FileRef {
                            path: rel.to_string(),
                            size: file.size,
                            digests: file.digests.clone(),
                        };
                        if entry.file_ref() != Some(&new_ref) {
                            changed = true;
                            stats.entries_updated += 1;
                        }
                        kept.push(ManifestEntry::from_file_ref(entry.tag(), new_ref));
                    }
                    None => {
                        // vanished, or now assigned to a deeper manifest
                        changed = true;
                        stats.entries_removed += 1;
                    }
                }
            }

            // remaining assignments are new files
            for (full, file) in assigned {
                if handled.contains(&full) {
                    continue;
                }
                let rel = strip_dir_prefix(&full, &dir).to_string();
                let tag = match coverage.lookup(&full) {
                    Coverage::Covered(_, existing) if existing.file_ref().is_some() => {
                        existing.tag()
                    }
                    _ => self.profile.entry_tag_for_path(&full),
                };
                changed = true;
                stats.entries_added += 1;
                kept.push(ManifestEntry::from_file_ref(
                    tag,
                    FileRef {
                        path: rel,
                        size: file.size,
                        digests: file.digests,
                    },
                ));
            }

            manifest.entries = kept;
            if changed {
                manifest.canonical_sort();
                self.dirty.insert(name);
            }
        }

        info!(
            subtree = %subtree,
            added = stats.entries_added,
            updated = stats.entries_updated,
            removed = stats.entries_removed,
            "updated entries"
        );
        Ok(stats)
    }

    // Create empty sub-manifests where the split policy calls for them.
    fn emit_submanifests(
        &mut self,
        subtree: &str,
        decided: &BTreeMap<String, FileRef>,
    ) -> Result<()> {
        let mut dir_counts: BTreeMap<String, usize> = BTreeMap::new();
        for path in decided.keys() {
            let mut dir = pathutil::parent_dir(path);
            while !dir.is_empty() {
                *dir_counts.entry(dir.to_string()).or_default() += 1;
                dir = pathutil::parent_dir(dir);
            }
        }

        for (dir, count) in dir_counts {
            if !pathutil::starts_with(&dir, subtree) {
                continue;
            }
            if !self.profile.want_submanifest(&dir, count) {
                continue;
            }
            // any manifest already rooted in this directory satisfies
            // the policy, whatever its compression suffix
            if self
                .manifests
                .keys()
                .any(|name| pathutil::parent_dir(name) == dir)
            {
                continue;
            }
            let manifest_path = pathutil::join(&dir, "Manifest");
            debug!(dir = %dir, "emitting sub-manifest per split policy");
            // resolve the parent before inserting, so the new manifest
            // cannot claim itself
            let parent = self.covering_manifest_for_dir(&dir);
            self.manifests
                .insert(manifest_path.clone(), ManifestFile::new());
            self.parents.insert(manifest_path.clone(), parent);
            self.dirty.insert(manifest_path);
        }
        Ok(())
    }

    // Deepest loaded manifest whose directory is a prefix of `path`,
    // excluding a manifest at `path` itself.
    fn covering_manifest(&self, path: &str) -> String {
        self.covering_manifest_for_dir(pathutil::parent_dir(path))
    }

    fn covering_manifest_for_dir(&self, dir: &str) -> String {
        let mut best: Option<&String> = None;
        let mut best_len = 0;
        for name in self.manifests.keys() {
            let manifest_dir = pathutil::parent_dir(name);
            if pathutil::starts_with(dir, manifest_dir) {
                // empty dir (top) is prefix of everything; prefer deeper
                let len = if manifest_dir.is_empty() {
                    0
                } else {
                    manifest_dir.len() + 1
                };
                if best.is_none() || len > best_len {
                    best = Some(name);
                    best_len = len;
                }
            }
        }
        best.cloned().unwrap_or_else(|| self.top_name.clone())
    }

    /// Write all modified manifests back to disk, bottom-up
    ///
    /// Children are written before parents so that each parent records
    /// the digests of the freshly written child. With `force`, every
    /// loaded manifest is rewritten. The top-level manifest is
    /// clearsigned per the configured signing policy.
    pub fn save_manifests(&mut self, force: bool) -> Result<SaveStats> {
        let mut stats = SaveStats::default();

        let mut order: Vec<String> = self.manifests.keys().cloned().collect();
        order.sort_by_key(|name| std::cmp::Reverse(name.matches('/').count()));

        for name in order {
            if name == self.top_name {
                continue;
            }
            if !force && !self.dirty.contains(&name) {
                continue;
            }

            let manifest = self.manifests.get_mut(&name).expect("key from map");
            manifest.canonical_sort();
            let text = manifest.dump();

            let format = if CompressionFormat::from_path(Path::new(&name))
                != CompressionFormat::None
            {
                // keep existing compressed manifests in their format
                CompressionFormat::from_path(Path::new(&name))
            } else if self.compress_format != CompressionFormat::None
                && text.len() as u64 >= self.compress_watermark
            {
                self.compress_format
            } else {
                CompressionFormat::None
            };

            let final_name = renamed_for_format(&name, format);
            let bytes = format.compress(text.as_bytes())?;
            compression::atomic_write(&self.root.join(&final_name), &bytes)?;
            if final_name != name {
                // compression changed the on-disk name; drop the old file
                let _ = std::fs::remove_file(self.root.join(&name));
                let manifest = self.manifests.remove(&name).expect("present");
                self.manifests.insert(final_name.clone(), manifest);
                if let Some(parent) = self.parents.remove(&name) {
                    self.parents.insert(final_name.clone(), parent);
                }
            }
            self.dirty.remove(&name);
            stats.manifests_written += 1;

            // record the fresh digests in the parent
            let digests = digest_bytes(&bytes, &self.hashes)?;
            let parent = self
                .parents
                .get(&final_name)
                .cloned()
                .unwrap_or_else(|| self.covering_manifest(&final_name));
            self.update_manifest_ref(&parent, &name, &final_name, bytes.len() as u64, digests);
        }

        // the top-level manifest goes last, carrying the child digests
        if force || self.dirty.contains(&self.top_name) {
            let top_name = self.top_name.clone();
            let manifest = self.manifests.get_mut(&top_name).expect("top is loaded");
            manifest.canonical_sort();
            let text = manifest.dump();

            let should_sign = match self.sign {
                Some(explicit) => explicit,
                None => manifest.signed,
            };
            let payload = if should_sign {
                let env = self
                    .openpgp
                    .as_ref()
                    .filter(|env| env.is_available())
                    .ok_or(MantreeError::OpenPgpUnavailable)?;
                stats.signed = true;
                env.clear_sign(text.as_bytes(), self.openpgp_key_id.as_deref())?
            } else {
                text.into_bytes()
            };

            let format = CompressionFormat::from_path(Path::new(&top_name));
            let bytes = format.compress(&payload)?;
            compression::atomic_write(&self.root.join(&top_name), &bytes)?;
            self.dirty.remove(&top_name);
            stats.manifests_written += 1;
        }

        info!(
            written = stats.manifests_written,
            signed = stats.signed,
            "saved manifests"
        );
        Ok(stats)
    }

    fn update_manifest_ref(
        &mut self,
        parent: &str,
        old_child: &str,
        child: &str,
        size: u64,
        digests: DigestMap,
    ) {
        let parent_dir = pathutil::parent_dir(parent).to_string();
        let old_rel = strip_dir_prefix(old_child, &parent_dir).to_string();
        let rel = strip_dir_prefix(child, &parent_dir).to_string();
        let Some(manifest) = self.manifests.get_mut(parent) else {
            return;
        };

        let new_ref = FileRef {
            path: rel.clone(),
            size,
            digests,
        };
        let mut changed = false;
        let mut found = false;
        for entry in manifest.entries.iter_mut() {
            if let ManifestEntry::Manifest(file) = entry {
                if file.path == old_rel || file.path == rel {
                    found = true;
                    if *file != new_ref {
                        *file = new_ref.clone();
                        changed = true;
                    }
                    break;
                }
            }
        }
        if !found {
            manifest
                .entries
                .push(ManifestEntry::Manifest(new_ref));
            changed = true;
        }
        if changed {
            self.dirty.insert(parent.to_string());
        }
    }
}

fn merge_entries(a: &ManifestEntry, b: &ManifestEntry) -> Option<ManifestEntry> {
    if a.tag() != b.tag() {
        return None;
    }
    match (a.file_ref(), b.file_ref()) {
        (Some(fa), Some(fb)) => fa
            .merge_compatible(fb)
            .map(|merged| ManifestEntry::from_file_ref(a.tag(), merged)),
        // identical path-only entries collapse
        (None, None) => Some(a.clone()),
        _ => None,
    }
}

fn failure_path(failure: &MantreeError) -> Option<&str> {
    match failure {
        MantreeError::MissingFile(path)
        | MantreeError::UnexpectedFile(path)
        | MantreeError::FileTypeMismatch { path, .. }
        | MantreeError::SizeMismatch { path, .. }
        | MantreeError::HashMismatch { path, .. } => Some(path),
        _ => None,
    }
}

fn strip_dir_prefix<'a>(path: &'a str, dir: &str) -> &'a str {
    if dir.is_empty() {
        return path;
    }
    match path.strip_prefix(dir) {
        Some(rest) if rest.starts_with('/') => &rest[1..],
        Some("") => "",
        _ => path,
    }
}

fn is_manifest_name(path: &str) -> bool {
    let name = pathutil::file_name(path);
    let base = name
        .strip_suffix(".gz")
        .or_else(|| name.strip_suffix(".bz2"))
        .or_else(|| name.strip_suffix(".xz"))
        .unwrap_or(name);
    base == "Manifest"
}

fn renamed_for_format(name: &str, format: CompressionFormat) -> String {
    let current = CompressionFormat::from_path(Path::new(name));
    if current == format {
        return name.to_string();
    }
    let dir = pathutil::parent_dir(name);
    let plain = "Manifest";
    match format.suffix() {
        None => pathutil::join(dir, plain),
        Some(suffix) => pathutil::join(dir, &format!("{}.{}", plain, suffix)),
    }
}

fn digest_bytes(data: &[u8], hashes: &[String]) -> Result<DigestMap> {
    let mut digests = DigestMap::new();
    for name in hashes {
        digests.insert(name.clone(), hashing::hash_bytes(data, name)?);
    }
    Ok(digests)
}

fn file_unchanged_since(path: &Path, expected_size: u64, since: DateTime<Utc>) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if meta.len() != expected_size {
        return false;
    }
    let Ok(modified) = meta.modified() else {
        return false;
    };
    DateTime::<Utc>::from(modified) < since
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
