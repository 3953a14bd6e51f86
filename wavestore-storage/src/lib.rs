//! Wavestore storage: WAL pipeline and TSC block engine
//!
//! This crate is the whole data path of a clinical waveform store, from the
//! producer-facing writer pool down to the compressed block files:
//!
//! - [`wal`]: the binary WAL file format: header, payload codec, writer,
//!   reader, and the quiescence-tracked batch
//! - [`pool`]: the writer pool multiplexing producer messages into open
//!   WAL files keyed by stream fingerprint
//! - [`pipeline`]: the batch read manager, worker pool, merge/sort flow,
//!   and the shared stream lock set
//! - [`engine`]: the TSC engine: sqlite metadata index, block container,
//!   file store, the ingest write path, and the file optimizer
//! - [`format`]: shared file-header traits
//! - [`metrics`]: operational counters for the pool and the pipeline
//!
//! ## Data flow
//!
//! ```text
//! producers → pool::WALFileManager → *.wal files
//!           → pipeline::ReadManager (scan, batch, quiesce)
//!           → pipeline::read_batch (parallel read, merge, sort)
//!           → engine::EngineIngest → engine::TscEngine → *.tsc files
//!                                        ↑
//!                  engine::Optimizer (daily small-file merge)
//! ```

pub mod engine;
pub mod format;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod wal;
