//! Common traits for fixed-size file headers
//!
//! Wavestore's on-disk formats (the WAL and the TSC block container) all
//! start with a packed little-endian header of a known size. These traits
//! keep encode/decode/validate behavior consistent across them.

use wavestore_core::{Error, Result};

use std::path::Path;

/// A fixed-size, versioned file header
pub trait FileHeader: Sized {
    /// Human-readable name for error messages
    const FORMAT_NAME: &'static str;

    /// Versions this build can read
    const SUPPORTED_VERSIONS: &'static [u8];

    /// Size of the packed header in bytes
    const HEADER_SIZE: usize;

    /// Encode the header to exactly `HEADER_SIZE` bytes
    fn encode(&self) -> Vec<u8>;

    /// Decode and validate a header from the front of `data`
    fn decode(data: &[u8]) -> Result<Self>;

    /// Validate field-level invariants
    fn validate(&self) -> Result<()>;

    /// Version number carried by this header
    fn version(&self) -> u8;

    /// Check the version against the supported set
    fn is_version_supported(&self) -> bool {
        Self::SUPPORTED_VERSIONS.contains(&self.version())
    }
}

/// Whole-file validation helpers
pub trait ValidateFile: FileHeader {
    /// Quickly validate a file's header without reading the entire file
    fn validate_file_header(path: &Path) -> Result<()> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(path)?;
        let mut header_bytes = vec![0u8; Self::HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|_| {
            Error::Corruption(format!(
                "{} file shorter than its {}-byte header",
                Self::FORMAT_NAME,
                Self::HEADER_SIZE
            ))
        })?;

        let header = Self::decode(&header_bytes)?;
        header.validate()
    }
}
