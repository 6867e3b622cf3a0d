//! Error types for the mantree library
//!
//! This module defines all error types that can occur during manifest
//! operations. Every error derives from the umbrella [`MantreeError`] so
//! callers can catch "any manifest problem" with a single match arm, while
//! still being able to distinguish the individual kinds.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the mantree library
pub type Result<T> = std::result::Result<T, MantreeError>;

/// Main error type for all manifest operations
#[derive(Debug, Error)]
pub enum MantreeError {
    /// I/O errors without a specific path context
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors during per-file operations
    #[error("IO error on {path:?}: {source}")]
    FileIo {
        /// Path where the error occurred
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Malformed manifest line
    #[error("Manifest syntax error at {path:?} line {line}: {reason}: {raw:?}")]
    ManifestSyntax {
        /// Manifest file containing the bad line
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// The raw line as read
        raw: String,
        /// Human-readable description of the problem
        reason: String,
    },

    /// Hash algorithm not supported by the backend
    #[error("Unsupported hash name: {0}")]
    UnsupportedHash(String),

    /// Compression suffix not supported
    #[error("Unsupported compression suffix: {0}")]
    UnsupportedCompression(String),

    /// A manifest path escapes the tree root
    #[error("Path {0:?} escapes the Manifest tree root")]
    PathTraversal(String),

    /// A filename contains a byte that cannot be represented
    #[error("Invalid filename {filename:?}: disallowed byte at position {position}")]
    InvalidFilename {
        /// The offending filename
        filename: String,
        /// Byte offset of the first disallowed byte
        position: usize,
    },

    /// A path crosses onto a different filesystem
    #[error("Path {0:?} crosses filesystem boundaries, it must be IGNORE-d explicitly")]
    CrossDevice(PathBuf),

    /// A symbolic link resolves outside the tree
    #[error("Symlink {0:?} points outside the Manifest tree, it must be IGNORE-d explicitly")]
    SymlinkEscape(PathBuf),

    /// MANIFEST references form a cycle
    #[error("Manifest reference cycle involving {0:?}")]
    ManifestCycle(String),

    /// Two manifests carry conflicting entries for one path
    #[error("Duplicate coverage for {path:?} (from {manifest_a:?} and {manifest_b:?})")]
    DuplicateCoverage {
        /// The multiply-covered path
        path: String,
        /// Manifest providing the first entry
        manifest_a: String,
        /// Manifest providing the conflicting entry
        manifest_b: String,
    },

    /// A covered file is absent from the tree
    #[error("Missing file: {0}")]
    MissingFile(String),

    /// A file exists in the tree but no entry covers it
    #[error("Unexpected file (no Manifest entry): {0}")]
    UnexpectedFile(String),

    /// A covered path is not a regular file
    #[error("File type mismatch for {path}: expected {expected}, found {found}")]
    FileTypeMismatch {
        /// The covered path
        path: String,
        /// Expected file type
        expected: String,
        /// Observed file type
        found: String,
    },

    /// File size differs from the manifest entry
    #[error("Size mismatch for {path}: expected {expected}, got {got}")]
    SizeMismatch {
        /// The covered path
        path: String,
        /// Size recorded in the entry
        expected: u64,
        /// Size observed on disk
        got: u64,
    },

    /// File digest differs from the manifest entry
    #[error("{algo} mismatch for {path}: expected {expected}, got {got}")]
    HashMismatch {
        /// The covered path
        path: String,
        /// Algorithm that mismatched
        algo: String,
        /// Digest recorded in the entry
        expected: String,
        /// Digest computed from disk
        got: String,
    },

    /// A sub-manifest does not verify against its parent's record
    #[error("Sub-Manifest {child:?} does not match the entry in {parent:?}")]
    InvalidSubManifest {
        /// Manifest carrying the MANIFEST entry
        parent: String,
        /// The sub-manifest that failed to verify
        child: String,
    },

    /// The TIMESTAMP entry is older than the permitted age
    #[error("Manifest timestamp {timestamp} is older than the permitted {max_age_secs} seconds")]
    StaleTimestamp {
        /// The TIMESTAMP value found
        timestamp: String,
        /// Maximum permitted age
        max_age_secs: u64,
    },

    /// Non-whitespace data outside the OpenPGP-signed part
    #[error("Unsigned data found in an OpenPGP signed Manifest: {0:?}")]
    UnsignedData(PathBuf),

    /// A signature was required but the manifest carries none
    #[error("Manifest {0:?} is not OpenPGP signed")]
    OpenPgpNoSignature(PathBuf),

    /// The signature did not verify
    #[error("OpenPGP verification failed:\n{0}")]
    OpenPgpBadSignature(String),

    /// The signing key has expired
    #[error("OpenPGP signature rejected because of expired key:\n{0}")]
    OpenPgpExpiredKey(String),

    /// The signing key was revoked
    #[error("OpenPGP signature rejected because of revoked key:\n{0}")]
    OpenPgpRevokedKey(String),

    /// The signing key is not present in the keyring
    #[error("OpenPGP signature made by an unknown key:\n{0}")]
    OpenPgpUnknownKey(String),

    /// The signature is good but the key is not trusted
    #[error("OpenPGP signature made by an untrusted key:\n{0}")]
    OpenPgpUntrustedKey(String),

    /// The signature was rejected for an unrecognized reason
    #[error("OpenPGP signature rejected for unknown reason:\n{0}")]
    OpenPgpUnknownFailure(String),

    /// Key import into the keyring failed
    #[error("OpenPGP key import failed:\n{0}")]
    OpenPgpKeyImport(String),

    /// Keyring refresh failed
    #[error("OpenPGP keyring refresh failed:\n{0}")]
    OpenPgpKeyRefresh(String),

    /// Clearsigning failed
    #[error("OpenPGP signing failed:\n{0}")]
    OpenPgpSigning(String),

    /// No usable OpenPGP tool was found at construction time
    #[error("OpenPGP signing/verification unavailable (install gnupg)")]
    OpenPgpUnavailable,

    /// An optional capability was not compiled in or not installed
    #[error("Feature unavailable: {0}")]
    FeatureUnavailable(&'static str),

    /// A profile name outside the closed registry
    #[error("Unknown profile: {0:?}")]
    UnknownProfile(String),

    /// Another update is already running over an overlapping subtree
    #[error("Busy: {0}")]
    Busy(String),

    /// Aggregate of per-path verification failures
    #[error("Verification failed with {} error(s)", failures.len())]
    VerificationFailed {
        /// The collected per-path failures, in sorted-path order
        failures: Vec<MantreeError>,
    },
}

impl MantreeError {
    /// Create a file-scoped I/O error
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MantreeError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Create a manifest syntax error
    pub fn syntax(
        path: impl Into<PathBuf>,
        line: usize,
        raw: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        MantreeError::ManifestSyntax {
            path: path.into(),
            line,
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error represents a per-path verification failure
    ///
    /// These are the kinds that verification accumulates rather than
    /// aborting on; the aggregate [`MantreeError::VerificationFailed`]
    /// itself also counts.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            MantreeError::MissingFile(_)
                | MantreeError::UnexpectedFile(_)
                | MantreeError::FileTypeMismatch { .. }
                | MantreeError::SizeMismatch { .. }
                | MantreeError::HashMismatch { .. }
                | MantreeError::StaleTimestamp { .. }
                | MantreeError::CrossDevice(_)
                | MantreeError::SymlinkEscape(_)
                | MantreeError::VerificationFailed { .. }
        )
    }

    /// Check if this error is an OpenPGP failure
    pub fn is_openpgp(&self) -> bool {
        matches!(
            self,
            MantreeError::OpenPgpNoSignature(_)
                | MantreeError::OpenPgpBadSignature(_)
                | MantreeError::OpenPgpExpiredKey(_)
                | MantreeError::OpenPgpRevokedKey(_)
                | MantreeError::OpenPgpUnknownKey(_)
                | MantreeError::OpenPgpUntrustedKey(_)
                | MantreeError::OpenPgpUnknownFailure(_)
                | MantreeError::OpenPgpKeyImport(_)
                | MantreeError::OpenPgpKeyRefresh(_)
                | MantreeError::OpenPgpSigning(_)
                | MantreeError::OpenPgpUnavailable
        )
    }

    /// Check if this error is an I/O failure
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            MantreeError::Io(_) | MantreeError::FileIo { .. } | MantreeError::WalkDir(_)
        )
    }
}
