use crate::types::ValueType;

use thiserror::Error;

use std::time::Duration;

/// Errors produced by the WAL pipeline and the TSC engine
///
/// Per-file errors (`Corruption`, `UnsupportedVersion`) never take down the
/// pipeline; they fail the file or batch they belong to. `Timeout` and the
/// fatal ingest path set the process-wide shutdown flag instead of being
/// retried.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure while reading, writing or unlinking a file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data that cannot be interpreted under the declared format
    #[error("corruption: {0}")]
    Corruption(String),

    /// Header version outside the supported set
    #[error("unsupported WAL version: {0}")]
    UnsupportedVersion(u8),

    /// A write supplied values of a different type than the file header
    #[error("value type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        expected: ValueType,
        found: ValueType,
    },

    /// Metadata index (SQL) failure
    #[error("index error: {0}")]
    Index(String),

    /// Optimizer post-condition failure: content differs after a rewrite
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// A worker exceeded its time budget; fatal to the pipeline
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),

    /// Catch-all for engine-level failures
    #[error("storage engine error: {0}")]
    StorageEngine(String),
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
