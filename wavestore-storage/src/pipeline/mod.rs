//! Batch ingestion pipeline
//!
//! Everything between a directory of quiescent WAL files and the storage
//! engine: a fixed worker pool, the per-batch read/merge/sort flow, the
//! directory-scanning read manager, and the stream lock set shared with the
//! optimizer.
//!
//! Scheduling is plain OS threads. The manager thread owns all batch
//! bookkeeping and only exchanges values with workers through completion
//! channels; workers never touch manager state.

mod locks;
mod read_manager;
mod read_process;
mod workers;

pub use locks::{StreamKey, StreamLocks};
pub use read_manager::ReadManager;
pub use read_process::{merge_payloads, read_batch, IngestSink};
pub use workers::{TaskHandle, WorkerPool};
