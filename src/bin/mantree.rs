//! # mantree CLI - Manifest tree verification and generation
//!
//! Command-line front-end over the mantree library.
//!
//! ## Usage
//! ```bash
//! # Verify the tree covering the current directory
//! mantree verify
//!
//! # Create a manifest tree with explicit hashes
//! mantree create -H "SHA256 SHA512" ./tree
//!
//! # Update after changing files, refreshing the timestamp
//! mantree update -t ./tree
//!
//! # Hash arbitrary files
//! mantree hash -H "SHA256 BLAKE2B" file1 file2
//! ```
//!
//! Exit codes: 0 success, 1 verification failure, 2 usage error,
//! 3 OpenPGP failure, 4 I/O error.

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use mantree::compression::CompressionFormat;
use mantree::loader::{ManifestLoader, UpdateOptions, VerifyOptions};
use mantree::openpgp::OpenPgpEnvironment;
use mantree::profile::Profile;
use mantree::toplevel;
use mantree::{MantreeError, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// mantree - verify and generate Manifest trees
#[derive(Parser)]
#[command(name = "mantree")]
#[command(version)]
#[command(about = "Full-tree integrity verifier for Manifest files")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one or more directories against their Manifests
    Verify {
        /// Paths to verify (defaults to the current directory)
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Continue reporting errors rather than stopping at the first
        #[arg(short = 'k', long)]
        keep_going: bool,

        /// Use only the OpenPGP key(s) from a specific file
        #[arg(short = 'K', long = "openpgp-key")]
        openpgp_key: Option<PathBuf>,

        /// Disable OpenPGP verification of signed Manifests
        #[arg(short = 'P', long = "no-openpgp-verify")]
        no_openpgp_verify: bool,

        /// Require the top-level Manifest to be OpenPGP signed
        #[arg(short = 's', long)]
        require_signed_manifest: bool,

        /// Maximum age of the TIMESTAMP entry, in seconds
        #[arg(long)]
        max_timestamp_age: Option<u64>,

        /// Also verify DIST entries against files in this directory
        #[arg(long)]
        distdir: Option<PathBuf>,
    },

    /// Create a Manifest tree for one or more directories
    Create {
        /// Directories to cover (defaults to the current directory)
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        generate: GenerateArgs,
    },

    /// Update the Manifest entries for one or more directory trees
    Update {
        /// Paths to update (defaults to the current directory)
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Compare mtimes against the TIMESTAMP entry and skip
        /// unchanged files
        #[arg(short = 'i', long)]
        incremental: bool,

        #[command(flatten)]
        generate: GenerateArgs,
    },

    /// Hash files with an explicit hash set
    Hash {
        /// Whitespace-separated list of hashes to use
        #[arg(short = 'H', long, value_name = "HASHES")]
        hashes: String,

        /// Files to hash
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Verify OpenPGP clearsigned files
    #[command(name = "openpgp-verify")]
    OpenPgpVerify {
        /// Use only the OpenPGP key(s) from a specific file
        #[arg(short = 'K', long = "openpgp-key")]
        openpgp_key: Option<PathBuf>,

        /// Clearsigned files to verify
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Verify a detached OpenPGP signature
    #[command(name = "openpgp-verify-detached")]
    OpenPgpVerifyDetached {
        /// Use only the OpenPGP key(s) from a specific file
        #[arg(short = 'K', long = "openpgp-key", required = true)]
        openpgp_key: PathBuf,

        /// The detached signature
        signature: PathBuf,

        /// The signed data file
        data: PathBuf,
    },
}

/// Flags shared by `create` and `update`
#[derive(clap::Args)]
struct GenerateArgs {
    /// Profile supplying defaults ("default", "ebuild", "old-ebuild",
    /// "egencache")
    #[arg(short = 'p', long)]
    profile: Option<String>,

    /// Whitespace-separated list of hashes to use
    #[arg(short = 'H', long, value_name = "HASHES")]
    hashes: Option<String>,

    /// Format for compressed Manifests (e.g. "gz", "bz2", "xz")
    #[arg(short = 'C', long = "compress-format")]
    compress_format: Option<String>,

    /// Minimum Manifest size for compression to apply
    #[arg(short = 'c', long = "compress-watermark")]
    compress_watermark: Option<u64>,

    /// Force rewriting all Manifests, even unmodified ones
    #[arg(short = 'f', long)]
    force_rewrite: bool,

    /// Sign the top-level Manifest
    #[arg(short = 's', long, overrides_with = "no_sign")]
    sign: bool,

    /// Do not sign the top-level Manifest
    #[arg(short = 'S', long, overrides_with = "sign")]
    no_sign: bool,

    /// Use the specified OpenPGP key id for signing
    #[arg(short = 'k', long = "openpgp-id")]
    openpgp_id: Option<String>,

    /// Use only the OpenPGP key(s) from a specific file
    #[arg(short = 'K', long = "openpgp-key")]
    openpgp_key: Option<PathBuf>,

    /// Write a TIMESTAMP entry
    #[arg(short = 't', long)]
    timestamp: bool,
}

impl GenerateArgs {
    fn sign_choice(&self) -> Option<bool> {
        if self.sign {
            Some(true)
        } else if self.no_sign {
            Some(false)
        } else {
            None
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            if let MantreeError::VerificationFailed { failures } = &e {
                for failure in failures {
                    eprintln!("  {}", failure);
                }
            }
            std::process::exit(exit_code(&e));
        }
    }
}

fn exit_code(e: &MantreeError) -> i32 {
    match e {
        MantreeError::UnknownProfile(_)
        | MantreeError::UnsupportedHash(_)
        | MantreeError::UnsupportedCompression(_) => 2,
        _ if e.is_openpgp() => 3,
        _ if e.is_io() => 4,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Verify {
            paths,
            keep_going,
            openpgp_key,
            no_openpgp_verify,
            require_signed_manifest,
            max_timestamp_age,
            distdir,
        } => cmd_verify(
            paths,
            keep_going,
            openpgp_key,
            no_openpgp_verify,
            require_signed_manifest,
            max_timestamp_age,
            distdir,
        ),
        Commands::Create { paths, generate } => cmd_generate(paths, generate, false, true),
        Commands::Update {
            paths,
            incremental,
            generate,
        } => cmd_generate(paths, generate, incremental, false),
        Commands::Hash { hashes, paths } => cmd_hash(&hashes, paths),
        Commands::OpenPgpVerify { openpgp_key, paths } => cmd_openpgp_verify(openpgp_key, paths),
        Commands::OpenPgpVerifyDetached {
            openpgp_key,
            signature,
            data,
        } => cmd_openpgp_verify_detached(openpgp_key, signature, data),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("static template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn keyed_environment(key_file: Option<&Path>) -> Result<Option<OpenPgpEnvironment>> {
    match key_file {
        None => Ok(None),
        Some(path) => {
            let env = OpenPgpEnvironment::isolated()?;
            let material = std::fs::read(path).map_err(|e| MantreeError::file_io(path, e))?;
            env.import_key(&material)?;
            Ok(Some(env))
        }
    }
}

fn cmd_verify(
    paths: Vec<PathBuf>,
    keep_going: bool,
    openpgp_key: Option<PathBuf>,
    no_openpgp_verify: bool,
    require_signed_manifest: bool,
    max_timestamp_age: Option<u64>,
    distdir: Option<PathBuf>,
) -> Result<()> {
    for path in &paths {
        let top = toplevel::find_top_level_manifest(path)?.ok_or_else(|| {
            MantreeError::file_io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "top-level Manifest not found",
                ),
            )
        })?;
        println!(
            "{} {}",
            "Verifying against".blue().bold(),
            top.display().to_string().cyan()
        );

        let start = Instant::now();
        let mut builder = ManifestLoader::builder()
            .verify_openpgp(!no_openpgp_verify)
            .require_signed(require_signed_manifest);
        if let Some(env) = keyed_environment(openpgp_key.as_deref())? {
            builder = builder.openpgp_env(env);
        }
        let mut loader = builder.build(&top)?;

        if let Some(signature) = &loader.top_manifest().signature {
            println!(
                "  {} signed by {} at {}",
                "✓".green().bold(),
                signature.primary_key_fingerprint.yellow(),
                signature
                    .timestamp
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "unknown time".to_string())
            );
        }

        let subtree = toplevel::subtree_of(&top, path)?;
        let options = VerifyOptions {
            fail_fast: !keep_going,
            max_timestamp_age,
            distdir: distdir.clone(),
            ..Default::default()
        };

        let pb = spinner("Verifying files...");
        let result = loader.assert_directory_verifies(&subtree, &options);
        pb.finish_and_clear();
        result?;

        println!(
            "{} {} validated in {}",
            "✓".green().bold(),
            path.display().to_string().cyan(),
            format_duration(start.elapsed()).to_string().cyan()
        );
    }
    Ok(())
}

fn cmd_generate(
    paths: Vec<PathBuf>,
    args: GenerateArgs,
    incremental: bool,
    create: bool,
) -> Result<()> {
    for path in &paths {
        let top = if create {
            path.join("Manifest")
        } else {
            toplevel::find_top_level_manifest(path)?.ok_or_else(|| {
                MantreeError::file_io(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "top-level Manifest not found",
                    ),
                )
            })?
        };

        let start = Instant::now();
        let mut builder = ManifestLoader::builder()
            .allow_create(create)
            .sign(args.sign_choice());
        if let Some(name) = &args.profile {
            builder = builder.profile(Profile::by_name(name)?);
        }
        if let Some(hashes) = &args.hashes {
            builder = builder.hashes(hashes.split_whitespace().map(|s| s.to_string()).collect());
        }
        if let Some(format) = &args.compress_format {
            builder = builder.compress_format(CompressionFormat::from_suffix(format)?);
        }
        if let Some(watermark) = args.compress_watermark {
            builder = builder.compress_watermark(watermark);
        }
        if let Some(key_id) = &args.openpgp_id {
            builder = builder.openpgp_key_id(key_id.clone());
        }
        if let Some(env) = keyed_environment(args.openpgp_key.as_deref())? {
            builder = builder.openpgp_env(env);
        }
        let mut loader = builder.build(&top)?;

        let subtree = if create {
            String::new()
        } else {
            toplevel::subtree_of(&top, path)?
        };
        let mut options = UpdateOptions::default();
        if incremental {
            options.incremental_since = loader.find_timestamp();
        }

        let pb = spinner("Scanning files...");
        let stats = loader.update_entries_for_directory(&subtree, &options);
        pb.finish_and_clear();
        let stats = stats?;

        // refresh the timestamp when requested, or when one is present;
        // a partial update must not claim tree-wide freshness
        if subtree.is_empty() && (args.timestamp || loader.find_timestamp().is_some()) {
            loader.set_timestamp(chrono::Utc::now());
        }

        let saved = loader.save_manifests(args.force_rewrite)?;

        println!(
            "{} {} updated in {}",
            "✓".green().bold(),
            path.display().to_string().cyan(),
            format_duration(start.elapsed()).to_string().cyan()
        );
        println!(
            "  Files: {} scanned, {} hashed",
            stats.files_scanned.to_string().cyan(),
            stats.files_hashed.to_string().cyan()
        );
        println!(
            "  Entries: {} added, {} updated, {} removed",
            stats.entries_added.to_string().cyan(),
            stats.entries_updated.to_string().cyan(),
            stats.entries_removed.to_string().cyan()
        );
        println!(
            "  Manifests written: {}{}",
            saved.manifests_written.to_string().cyan(),
            if saved.signed {
                format!(" ({})", "signed".yellow())
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn cmd_hash(hashes: &str, paths: Vec<PathBuf>) -> Result<()> {
    let hash_names: Vec<String> = hashes.split_whitespace().map(|s| s.to_string()).collect();
    for path in &paths {
        let result = mantree::hashing::hash_path(path, &hash_names)?;
        println!("{}:", path.display().to_string().cyan());
        println!("  {} {}", "SIZE".bold(), result.size);
        for (algo, digest) in &result.digests {
            println!("  {} {}", algo.bold(), digest);
        }
    }
    Ok(())
}

fn cmd_openpgp_verify(openpgp_key: Option<PathBuf>, paths: Vec<PathBuf>) -> Result<()> {
    let env = match keyed_environment(openpgp_key.as_deref())? {
        Some(env) => env,
        None => OpenPgpEnvironment::system(),
    };
    for path in &paths {
        let data = std::fs::read(path).map_err(|e| MantreeError::file_io(path, e))?;
        let (_, signature) = env.verify_stream(&data)?;
        println!(
            "{} {} signed by {} at {}",
            "✓".green().bold(),
            path.display().to_string().cyan(),
            signature.primary_key_fingerprint.yellow(),
            signature
                .timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "unknown time".to_string())
        );
    }
    Ok(())
}

fn cmd_openpgp_verify_detached(
    openpgp_key: PathBuf,
    signature: PathBuf,
    data: PathBuf,
) -> Result<()> {
    let env = keyed_environment(Some(&openpgp_key))?.expect("key file provided");
    let result = env.verify_detached(&signature, &data)?;
    println!(
        "{} {} signed by {} at {}",
        "✓".green().bold(),
        data.display().to_string().cyan(),
        result.primary_key_fingerprint.yellow(),
        result
            .timestamp
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "unknown time".to_string())
    );
    Ok(())
}
