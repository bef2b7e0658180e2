use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{BackendError, Result};

/// The four-byte magic number identifying a GGUF model file: ASCII "GGUF".
pub const GGUF_MAGIC: [u8; 4] = [0x47, 0x47, 0x55, 0x46];

/// Oldest and newest GGUF versions an engine may be handed.
pub const GGUF_MIN_VERSION: u32 = 2;
pub const GGUF_MAX_VERSION: u32 = 3;

/// A model file that passed the header probe, memory-mapped for the engine.
///
/// Only the magic and version are checked here; interpreting the rest of the
/// file is the engine's job.
pub struct ModelFile {
    path: PathBuf,
    version: u32,
    mmap: Mmap,
}

impl ModelFile {
    /// Open `path`, validate its GGUF header, then memory-map the whole file.
    pub fn open(path: &Path) -> Result<ModelFile> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(&file);
        let version = probe_header(&mut reader)?;

        let mmap = unsafe { Mmap::map(&file)? };

        Ok(ModelFile {
            path: path.to_path_buf(),
            version,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// GGUF format version found in the header.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Entire file contents.
    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// Read and validate the 4-byte magic and u32 LE version.
fn probe_header(reader: &mut impl Read) -> Result<u32> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != GGUF_MAGIC {
        return Err(BackendError::InvalidModelMagic(magic));
    }

    let mut buf4 = [0u8; 4];
    reader.read_exact(&mut buf4)?;
    let version = u32::from_le_bytes(buf4);
    if !(GGUF_MIN_VERSION..=GGUF_MAX_VERSION).contains(&version) {
        return Err(BackendError::UnsupportedModelVersion(version));
    }
    Ok(version)
}
