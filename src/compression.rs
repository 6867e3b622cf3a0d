//! Transparent compression for manifest files
//!
//! Manifests may be stored compressed; the format is selected purely by
//! filename suffix (`Manifest.gz`, `Manifest.bz2`, `Manifest.xz`). This
//! module provides suffix detection, transparent readers, and atomic
//! writers: a manifest is serialized (and compressed) in memory, written
//! to a temporary file in the target directory, fsynced, and renamed into
//! place. An interrupted write never leaves a truncated file where a
//! valid one used to be.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mantree::compression::CompressionFormat;
//! use std::path::Path;
//!
//! # fn main() -> mantree::Result<()> {
//! let format = CompressionFormat::from_path(Path::new("sub/Manifest.gz"));
//! assert_eq!(format, CompressionFormat::Gzip);
//! let data = mantree::compression::read_file(Path::new("sub/Manifest.gz"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::{MantreeError, Result};
use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::trace;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

/// Compression applied to a manifest file on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionFormat {
    /// Plain, uncompressed text
    #[default]
    None,
    /// gzip (`.gz`)
    Gzip,
    /// bzip2 (`.bz2`)
    Bzip2,
    /// xz / lzma (`.xz`)
    Xz,
}

impl CompressionFormat {
    /// Detect the format from a path's suffix
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => CompressionFormat::Gzip,
            Some("bz2") => CompressionFormat::Bzip2,
            Some("xz") | Some("lzma") => CompressionFormat::Xz,
            _ => CompressionFormat::None,
        }
    }

    /// Look up a format by its standard suffix, without the leading dot
    ///
    /// The empty string selects no compression.
    ///
    /// # Errors
    ///
    /// [`MantreeError::UnsupportedCompression`] for unknown suffixes.
    pub fn from_suffix(suffix: &str) -> Result<Self> {
        match suffix {
            "" | "none" => Ok(CompressionFormat::None),
            "gz" => Ok(CompressionFormat::Gzip),
            "bz2" => Ok(CompressionFormat::Bzip2),
            "xz" | "lzma" => Ok(CompressionFormat::Xz),
            other => Err(MantreeError::UnsupportedCompression(other.to_string())),
        }
    }

    /// The filename suffix for this format, without the leading dot
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            CompressionFormat::None => None,
            CompressionFormat::Gzip => Some("gz"),
            CompressionFormat::Bzip2 => Some("bz2"),
            CompressionFormat::Xz => Some("xz"),
        }
    }

    /// Wrap a reader with the matching decompressor
    pub fn wrap_reader<'a, R: Read + 'a>(&self, reader: R) -> Box<dyn Read + 'a> {
        match self {
            CompressionFormat::None => Box::new(reader),
            CompressionFormat::Gzip => Box::new(MultiGzDecoder::new(reader)),
            CompressionFormat::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
            CompressionFormat::Xz => Box::new(XzDecoder::new_multi_decoder(reader)),
        }
    }

    /// Compress a buffer with this format
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionFormat::None => Ok(data.to_vec()),
            CompressionFormat::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionFormat::Bzip2 => {
                let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionFormat::Xz => {
                let mut encoder = XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress a buffer in this format
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.wrap_reader(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Read an entire (possibly compressed) file into memory
///
/// The compression format is selected from the path suffix.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let format = CompressionFormat::from_path(path);
    trace!(?path, ?format, "reading manifest file");
    let file = File::open(path).map_err(|e| MantreeError::file_io(path, e))?;
    let mut out = Vec::new();
    format
        .wrap_reader(file)
        .read_to_end(&mut out)
        .map_err(|e| MantreeError::file_io(path, e))?;
    Ok(out)
}

/// Atomically write a (possibly compressed) file
///
/// The content is compressed per the path suffix, written to a temporary
/// file in the same directory, fsynced, and renamed over the target.
pub fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    let format = CompressionFormat::from_path(path);
    let compressed = format.compress(content)?;
    atomic_write(path, &compressed)
}

/// Atomic raw write (write to temp file, fsync, then rename)
///
/// The temporary file lives in the target's directory so the final
/// rename never crosses a filesystem boundary. On failure the temporary
/// file is unlinked by [`tempfile`]'s drop guard.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| MantreeError::file_io(path, e))?;
    tmp.write_all(content)
        .map_err(|e| MantreeError::file_io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| MantreeError::file_io(path, e))?;
    tmp.persist(path)
        .map_err(|e| MantreeError::file_io(path, e.error))?;
    Ok(())
}
