//! Configuration for each pipeline stage
//!
//! Every struct carries production defaults in its `Default` impl; loading
//! values from files or the environment is the embedding service's problem.

use crate::SyncMode;

use serde::Deserialize;

use std::path::PathBuf;

/// Default batch quiescence threshold in seconds (5 minutes)
pub const DEFAULT_WAIT_CLOSE_TIME_S: u64 = 60 * 5;

/// Settings for the WAL writer pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterPoolConfig {
    /// Directory all WAL files are written into
    pub wal_dir: PathBuf,
    /// Width of the file-start-time bucket in seconds; all messages of one
    /// stream within a bucket share one file across restarts
    pub file_length_time_s: u64,
    /// Close a writer whose stream has been silent this long
    pub idle_timeout_s: u64,
    /// How often the background GC wakes up
    pub gc_interval_s: u64,
    /// Flush an entry once this many points are buffered
    pub flush_max_points: u64,
    /// Flush a non-empty entry at least this often
    pub flush_max_seconds: u64,
    /// Hard cap on simultaneously open writers; admission beyond the cap
    /// closes the least-recently-used entry
    pub max_open_files: usize,
    pub sync_mode: SyncMode,
}

impl Default for WriterPoolConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            file_length_time_s: 3600,
            idle_timeout_s: 600,
            gc_interval_s: 300,
            flush_max_points: 5000,
            flush_max_seconds: 120,
            max_open_files: 1024,
            sync_mode: SyncMode::Normal,
        }
    }
}

/// Settings for the batch read manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadManagerConfig {
    /// Directory scanned for `*.wal` files
    pub wal_dir: PathBuf,
    /// A batch is ready once every file's mtime is at least this old
    pub wait_close_time_s: u64,
    /// Size of the ingest worker pool
    pub max_workers: usize,
    /// Budget for one batch read + ingest; exceeding it is fatal
    pub wal_file_timeout_s: u64,
    /// Unlink source files after any non-corrupt ingest outcome
    pub delete_on_ingest: bool,
}

impl Default for ReadManagerConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("wal"),
            wait_close_time_s: DEFAULT_WAIT_CLOSE_TIME_S,
            max_workers: 4,
            wal_file_timeout_s: 1800,
            delete_on_ingest: true,
        }
    }
}

/// Settings for the TSC storage engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the compressed block-file tree
    pub tsc_dir: PathBuf,
    /// Target number of samples per block
    pub block_num_values: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tsc_dir: PathBuf::from("tsc"),
            block_num_values: 32768,
        }
    }
}

/// Settings for the TSC file optimizer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Minimum desired size of a TSC file; files below it are merge
    /// candidates and rewritten files are guaranteed at least this large
    pub target_file_size: u64,
    /// Upper bound on blocks rewritten per stream per run, unless more are
    /// needed to reach `target_file_size`
    pub max_blocks_per_run: usize,
    /// Budget for optimizing one stream; exceeding it is fatal
    pub optimization_timeout_s: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            target_file_size: 100_000_000,
            max_blocks_per_run: 10_000,
            optimization_timeout_s: 3600,
        }
    }
}
