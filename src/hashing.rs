//! Streaming hash multiplexer
//!
//! Verification and manifest creation both need several digests of the
//! same file. This module feeds a byte source exactly once through any
//! number of hash algorithms plus a byte counter, with bounded memory:
//! the stream is read in fixed-size chunks and every hasher is updated
//! from the same buffer.
//!
//! Algorithm names are the uppercase canonical manifest tokens
//! (`SHA256`, `BLAKE2B`, `WHIRLPOOL`, ...). Unknown names fail with
//! [`MantreeError::UnsupportedHash`] before any I/O is performed, so
//! callers (and tests) can skip cleanly.
//!
//! ## Example
//!
//! ```rust
//! use mantree::hashing::hash_bytes;
//!
//! let digest = hash_bytes(b"hello\n", "SHA256").unwrap();
//! assert_eq!(
//!     digest,
//!     "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
//! );
//! ```

use crate::error::{MantreeError, Result};
use blake2::{Blake2b512, Blake2s256};
use digest::{Digest, DynDigest};
use md5::Md5;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use sha3::{Sha3_256, Sha3_512};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use whirlpool::Whirlpool;

/// Chunk size for streaming reads; constant w.r.t. stream length
pub const HASH_BUFFER_SIZE: usize = 65536;

/// Digest mapping produced by the multiplexer: algorithm name to
/// lowercase hex digest
pub type DigestMap = BTreeMap<String, String>;

/// Canonical manifest tokens of every supported algorithm
pub const SUPPORTED_HASHES: &[&str] = &[
    "MD5",
    "SHA1",
    "SHA256",
    "SHA512",
    "RMD160",
    "WHIRLPOOL",
    "BLAKE2B",
    "BLAKE2S",
    "SHA3_256",
    "SHA3_512",
];

/// Result of multiplexed hashing: digests plus the total byte count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashResult {
    /// Total number of bytes consumed from the source
    pub size: u64,
    /// Hex digest per requested algorithm
    pub digests: DigestMap,
}

fn new_digest(name: &str) -> Result<Box<dyn DynDigest>> {
    Ok(match name {
        "MD5" => Box::new(Md5::new()),
        "SHA1" => Box::new(Sha1::new()),
        "SHA256" => Box::new(Sha256::new()),
        "SHA512" => Box::new(Sha512::new()),
        "RMD160" => Box::new(Ripemd160::new()),
        "WHIRLPOOL" => Box::new(Whirlpool::new()),
        "BLAKE2B" => Box::new(Blake2b512::new()),
        "BLAKE2S" => Box::new(Blake2s256::new()),
        "SHA3_256" => Box::new(Sha3_256::new()),
        "SHA3_512" => Box::new(Sha3_512::new()),
        other => return Err(MantreeError::UnsupportedHash(other.to_string())),
    })
}

/// Check whether an algorithm name is supported
pub fn is_supported(name: &str) -> bool {
    SUPPORTED_HASHES.contains(&name)
}

/// Hash a reader through all requested algorithms in a single pass
///
/// All hashers are constructed up front, so an unsupported name fails
/// before the first read. The reader is consumed to EOF.
///
/// # Errors
///
/// - [`MantreeError::UnsupportedHash`] for an unknown algorithm name
/// - [`MantreeError::Io`] on read failure
pub fn hash_reader<R: Read>(mut reader: R, hash_names: &[String]) -> Result<HashResult> {
    let mut hashers: Vec<(&str, Box<dyn DynDigest>)> = Vec::with_capacity(hash_names.len());
    for name in hash_names {
        hashers.push((name.as_str(), new_digest(name)?));
    }

    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size: u64 = 0;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buffer[..n]);
        }
    }

    let mut digests = DigestMap::new();
    for (name, hasher) in hashers {
        digests.insert(name.to_string(), hex::encode(hasher.finalize()));
    }
    Ok(HashResult { size, digests })
}

/// Hash the file at `path` through all requested algorithms
///
/// # Errors
///
/// - [`MantreeError::UnsupportedHash`] for an unknown algorithm name
/// - [`MantreeError::FileIo`] if the file cannot be opened or read
pub fn hash_path(path: &Path, hash_names: &[String]) -> Result<HashResult> {
    // construct hashers first so UnsupportedHash wins over FileIo
    for name in hash_names {
        new_digest(name)?;
    }
    let file = File::open(path).map_err(|e| MantreeError::file_io(path, e))?;
    match hash_reader(file, hash_names) {
        Err(MantreeError::Io(e)) => Err(MantreeError::file_io(path, e)),
        other => other,
    }
}

/// Hash an in-memory buffer with a single algorithm
pub fn hash_bytes(data: &[u8], hash_name: &str) -> Result<String> {
    let mut hasher = new_digest(hash_name)?;
    hasher.update(data);
    Ok(hex::encode(hasher.finalize()))
}
