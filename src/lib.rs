//! # mantree - Manifest tree integrity verifier
//!
//! A full-tree integrity and authenticity verifier for hierarchical
//! file trees described by textual manifest files (the GLEP 74 scheme):
//! each directory may carry a `Manifest` listing entries for its files
//! with cryptographic hashes and sizes, optionally clearsigned with
//! OpenPGP. Manifests chain by reference, so verifying the top-level
//! manifest recursively authenticates the whole tree.
//!
//! ## Overview
//!
//! mantree provides:
//! - Recursive, lazy loading of manifest chains with sub-manifest
//!   digest verification (the parent's digests are the sole trust root
//!   for each child)
//! - Whole-tree verification with stray/missing detection and error
//!   aggregation, hashing files on a worker pool
//! - Manifest creation and update that re-verifies: scan a tree,
//!   merge with existing entries, rewrite manifests bottom-up
//! - A strict line-oriented codec for the manifest grammar, including
//!   gzip/bzip2/xz compressed manifests
//! - An OpenPGP envelope around an external signing tool (GnuPG),
//!   with system and isolated keyring flavors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mantree::loader::{ManifestLoader, VerifyOptions};
//! use std::path::Path;
//!
//! # fn main() -> mantree::Result<()> {
//! // Verify a tree against its top-level Manifest
//! let mut loader = ManifestLoader::builder()
//!     .build(Path::new("./tree/Manifest"))?;
//! loader.assert_directory_verifies("", &VerifyOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! Creating a manifest tree:
//!
//! ```rust,no_run
//! use mantree::loader::{ManifestLoader, UpdateOptions};
//! use std::path::Path;
//!
//! # fn main() -> mantree::Result<()> {
//! let mut loader = ManifestLoader::builder()
//!     .allow_create(true)
//!     .hashes(vec!["SHA256".to_string(), "SHA512".to_string()])
//!     .build(Path::new("./tree/Manifest"))?;
//! loader.update_entries_for_directory("", &UpdateOptions::default())?;
//! loader.set_timestamp(chrono::Utc::now());
//! loader.save_manifests(false)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`loader`]: recursive loader/verifier, the heart of the crate
//! - [`manifest`]: single-manifest codec (parse/emit, clearsign strip)
//! - [`entry`]: the tagged entry types
//! - [`scanner`]: concurrent filesystem scanner
//! - [`hashing`]: streaming hash multiplexer
//! - [`compression`]: transparent `.gz`/`.bz2`/`.xz` handling
//! - [`openpgp`]: envelope around the external OpenPGP tool
//! - [`profile`]: named defaults for creation/update
//! - [`pathutil`]: manifest path rules and escapes
//! - [`toplevel`]: upward search for the covering top-level manifest
//! - [`verify`]: per-file verification primitives
//! - [`error`]: the error taxonomy

pub mod compression;
pub mod entry;
pub mod error;
pub mod hashing;
pub mod loader;
pub mod manifest;
pub mod openpgp;
pub mod pathutil;
pub mod profile;
pub mod scanner;
pub mod toplevel;
pub mod verify;

// Re-export main types for convenience
pub use entry::{EntryTag, FileRef, ManifestEntry};
pub use error::{MantreeError, Result};
pub use loader::{ManifestLoader, ManifestLoaderBuilder, UpdateOptions, VerifyOptions};
pub use manifest::ManifestFile;
pub use openpgp::OpenPgpEnvironment;
pub use profile::Profile;
