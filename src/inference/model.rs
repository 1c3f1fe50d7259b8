//! GGUF header inspection
//!
//! The native loader aborts on malformed files in ways that are hard to recover
//! from, so every path is checked here before it crosses the native boundary.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: u64 = 24;

/// Errors raised while inspecting a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Cannot read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: magic 0x{:08X} (expected 0x{:08X})", .0, GGUF_MAGIC)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to hold a GGUF header ({0} bytes)")]
    Truncated(u64),
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    /// Size of the whole file on disk
    pub file_size: u64,
}

/// Reads and checks the GGUF header of `path`.
///
/// Only versions 2 and 3 are accepted; older files use 32-bit counts that the
/// native loader no longer understands.
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < GGUF_HEADER_LEN {
        return Err(ModelError::Truncated(file_size));
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; GGUF_HEADER_LEN as usize];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
        file_size,
    })
}

/// True when the path carries a `.gguf` extension (case-insensitive).
pub fn has_gguf_extension<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn write_test_gguf(path: &Path, version: u32) {
    use std::io::Write;

    let mut file = File::create(path).unwrap();
    file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
    file.write_all(&version.to_le_bytes()).unwrap();
    file.write_all(&12u64.to_le_bytes()).unwrap();
    file.write_all(&7u64.to_le_bytes()).unwrap();
    file.write_all(&[0u8; 16]).unwrap();
    file.flush().unwrap();
}
