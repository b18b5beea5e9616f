//! GGUF file checks
//!
//! Both the language model and the multimodal projector ship as GGUF files.
//! Their headers are checked before anything is handed to llama.cpp so a wrong
//! path fails with a readable message instead of a loader error code.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Oldest and newest header versions llama.cpp still reads
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

/// Name fragment identifying projector files
pub const PROJECTOR_NAME_TAG: &str = "mmproj";

/// Errors found while reading a GGUF header
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("cannot read file: {0}")]
    Io(#[from] io::Error),

    #[error("not a GGUF file (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("file is truncated before the end of the GGUF header")]
    Truncated,
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    /// Parses the header from the start of `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, GgufError> {
        let magic = read_u32(reader)?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }

        let version = read_u32(reader)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: read_u64(reader)?,
            metadata_kv_count: read_u64(reader)?,
        })
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, GgufError> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, GgufError> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), GgufError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => GgufError::Truncated,
        _ => GgufError::Io(e),
    })
}

/// Opens `path` and reads its GGUF header.
pub fn inspect_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut reader = BufReader::new(File::open(path)?);
    GgufHeader::read_from(&mut reader)
}

/// Returns true if the file name marks it as a multimodal projector.
pub fn is_projector_file<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase().contains(PROJECTOR_NAME_TAG))
        .unwrap_or(false)
}

/// Returns true for files with a `.gguf` extension and a readable header.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let has_extension = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);
    has_extension && inspect_gguf(path).is_ok()
}
