//! Wavestore: a write-ahead-log pipeline for clinical waveform timeseries
//!
//! Facade crate re-exporting the workspace members: `wavestore-core` holds
//! the shared vocabulary (errors, enums, typed value arrays, configs) and
//! `wavestore-storage` holds the pipeline itself (WAL format, writer pool,
//! read manager, TSC engine and optimizer).

pub use wavestore_core::{
    EngineConfig, Error, IngestStatus, OptimizerConfig, ReadManagerConfig, Result, SyncMode,
    WriterPoolConfig,
};
pub use wavestore_storage::{engine, metrics, pipeline, pool, wal};
