//! Write-Ahead Log (WAL) implementation
//!
//! The WAL buffers streaming sensor data durably on disk until the batch
//! pipeline has seen a full quiescence window and hands the data to the
//! storage engine.
//!
//! ## File Format Overview
//!
//! A WAL file consists of:
//! 1. A 249-byte header (see [`WALHeader`])
//! 2. Zero or more records, laid out per the header's mode
//!
//! ```text
//! +----------------+
//! |   WAL Header   |  249 bytes - stream identity and record layout
//! +----------------+
//! |     Record     |  One message from the producer
//! +----------------+
//! |     Record     |
//! +----------------+
//! |      ...       |
//! +----------------+
//! ```
//!
//! Records carry no per-record framing beyond what the header implies: in
//! fixed-stride layouts every record is the same size, and in the
//! variable-stride interval layout each record declares its own sample
//! count. Recovery from a torn tail is therefore structural; see the
//! truncation policy in [`payload`].
//!
//! ## Stream identity
//!
//! The header's canonical encoding is hashed (xxh3, 128-bit) into a
//! [`Fingerprint`] that names the stream. All files of one stream share the
//! filename prefix `<fingerprint>-`, which is how the read side groups them
//! back into batches without opening them.
//!
//! # Examples
//!
//! ## Writing
//!
//! ```no_run
//! use wavestore_storage::wal::{FileSuffix, WALWriter};
//! use wavestore_core::{SyncMode, Value};
//! # let header = todo!();
//!
//! let (mut writer, _name) =
//!     WALWriter::create_for_header("wal", &header, FileSuffix::Random, SyncMode::Normal)?;
//! writer.write_time_value_pair(1_700_000_000_000_000_000, 1_700_000_000_000_000_500,
//!     Value::Float64(61.0))?;
//! writer.flush()?;
//! writer.close()?;
//! # Ok::<(), wavestore_core::Error>(())
//! ```
//!
//! ## Reading
//!
//! ```no_run
//! use wavestore_storage::wal::WALReader;
//!
//! let reader = WALReader::new("wal/somefile.wal");
//! match reader.read_all()? {
//!     Some(payload) => println!("{} messages", payload.num_messages()),
//!     None => println!("file shorter than a header"),
//! }
//! # Ok::<(), wavestore_core::Error>(())
//! ```

mod batch;
mod header;
pub mod payload;
mod reader;
mod writer;

pub use batch::WALBatch;
pub use header::{
    Fingerprint, WALHeader, NAME_FIELD_LEN, WAL_CURRENT_VERSION, WAL_HEADER_SIZE,
    WAL_SUPPORTED_VERSIONS,
};
pub use payload::{WALPayload, INTERVAL_MESSAGE_PREFIX_SIZE, TIME_VALUE_PREFIX_SIZE};
pub use reader::WALReader;
pub use writer::{wal_file_name, FileSuffix, WALWriter};
