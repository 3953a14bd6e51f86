// 1. Local crate imports
use super::header::Fingerprint;
use wavestore_core::{IngestStatus, Result};

// 2. External crate imports
// (none in this file)

// 3. Standard library imports
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A set of WAL files sharing one fingerprint, plus a quiescence deadline
///
/// Paths are kept in insertion order and de-duplicated. A batch is *ready*
/// for ingestion once it is non-empty and every file's mtime is at least
/// `wait_close_time` old, i.e. no producer has touched the stream for the
/// full quiescence window.
#[derive(Debug)]
pub struct WALBatch {
    paths: Vec<PathBuf>,
    wait_close_time: Duration,
    fingerprint: Option<Fingerprint>,
    /// Outcome of the ingest callback once the batch has been processed
    pub result: Option<IngestStatus>,
}

impl WALBatch {
    pub fn new(wait_close_time: Duration, fingerprint: Option<Fingerprint>) -> Self {
        Self {
            paths: Vec::new(),
            wait_close_time,
            fingerprint,
            result: None,
        }
    }

    pub fn from_paths(
        paths: impl IntoIterator<Item = PathBuf>,
        wait_close_time: Duration,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        let mut batch = Self::new(wait_close_time, fingerprint);
        for path in paths {
            batch.add(path);
        }
        batch
    }

    /// Adds a path; no-op if already present
    pub fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    pub fn wait_close_time(&self) -> Duration {
        self.wait_close_time
    }

    /// Whether every file has been quiescent for the full window
    ///
    /// An empty batch is never ready. A missing file is an error: the caller
    /// drops the batch and the surviving files are rediscovered on the next
    /// directory scan.
    pub fn is_ready(&self) -> Result<bool> {
        if self.paths.is_empty() {
            return Ok(false);
        }

        let now = SystemTime::now();
        for path in &self.paths {
            let mtime = fs::metadata(path)?.modified()?;
            let age = now
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age < self.wait_close_time {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Unlinks every path, best-effort
    ///
    /// All paths are attempted even if some fail; the first error is
    /// returned afterwards.
    pub fn delete_all(&self) -> Result<()> {
        let mut first_error = None;
        for path in &self.paths {
            if let Err(e) = fs::remove_file(path) {
                log::error!("failed to delete {}: {e}", path.display());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }
}
