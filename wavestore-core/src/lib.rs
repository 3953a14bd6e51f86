//! Core types shared across the Wavestore crates
//!
//! This crate holds the leaf-level vocabulary of the pipeline: the error
//! taxonomy, the enumerations baked into the WAL file format, the typed
//! value arrays that flow from producers to the storage engine, and the
//! configuration structs for each stage.

mod config;
mod error;
mod types;

pub use config::{
    EngineConfig, OptimizerConfig, ReadManagerConfig, WriterPoolConfig, DEFAULT_WAIT_CLOSE_TIME_S,
};
pub use error::{Error, Result};
pub use types::{
    IngestStatus, Nanos, ScaleType, SyncMode, Value, ValueArray, ValueMode, ValueType,
};
