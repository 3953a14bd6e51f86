//! TSC block container
//!
//! A TSC file is a plain concatenation of blocks. Each block is a packed
//! 48-byte little-endian header followed by an lz4-compressed body holding
//! the block's time data and values:
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  -----         -----------
//! 0       1     version       Container version (1)
//! 1       1     time_type     1 = timestamp array, 2 = gap array
//! 2       1     value_type    1 = int64, 2 = double
//! 3       1     flags         Reserved, 0
//! 4       4     num_values    Samples in this block
//! 8       8     start_time_n  First sample time (ns)
//! 16      8     end_time_n    Last sample time (ns)
//! 24      8     scale_b       Linear scale offset of the source stream
//! 32      8     scale_m       Linear scale slope of the source stream
//! 40      4     body_crc32    CRC32 of the compressed body
//! 44      4     body_len      Compressed body length in bytes
//! 48      ...   body          lz4 (size-prepended) compressed
//! ```
//!
//! Body layout (before compression): `n_time_entries: u32`, the time
//! entries (8 bytes each for timestamps, 16 for gap pairs), then
//! `num_values` raw 8-byte values.
//!
//! The checksum covers exactly the bytes on disk, so a corrupt read is
//! caught before decompression. The scientific columnar codec sits behind
//! this container and is out of scope here; blocks store widened raw
//! arrays.

use wavestore_core::{Error, Result};

use bytes::{Buf, BufMut};
use crc32fast::Hasher;

/// Container version
pub const TSC_BLOCK_VERSION: u8 = 1;

/// Size of the packed block header
pub const TSC_BLOCK_HEADER_SIZE: usize = 48;

/// Time encoded as one timestamp per sample
pub const T_TYPE_TIMESTAMP_ARRAY: u8 = 1;
/// Time encoded as a start time plus sparse gap pairs
pub const T_TYPE_GAP_ARRAY: u8 = 2;

/// Values widened to int64
pub const V_TYPE_INT64: u8 = 1;
/// Values widened to double
pub const V_TYPE_DOUBLE: u8 = 2;

/// Time axis of one block
#[derive(Debug, Clone, PartialEq)]
pub enum TimeData {
    /// Explicit per-sample timestamps; used for aperiodic streams
    Timestamps(Vec<i64>),
    /// `(sample_index, extra_ns)` pairs marking where the inter-sample
    /// delta exceeds the stream's nominal period
    GapArray(Vec<(i64, i64)>),
}

impl TimeData {
    pub fn type_code(&self) -> u8 {
        match self {
            TimeData::Timestamps(_) => T_TYPE_TIMESTAMP_ARRAY,
            TimeData::GapArray(_) => T_TYPE_GAP_ARRAY,
        }
    }
}

/// Value payload of one block
#[derive(Debug, Clone, PartialEq)]
pub enum BlockValues {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
}

impl BlockValues {
    pub fn type_code(&self) -> u8 {
        match self {
            BlockValues::Int64(_) => V_TYPE_INT64,
            BlockValues::Float64(_) => V_TYPE_DOUBLE,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BlockValues::Int64(v) => v.len(),
            BlockValues::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded block
#[derive(Debug, Clone, PartialEq)]
pub struct TscBlock {
    pub start_time_n: i64,
    pub end_time_n: i64,
    pub scale_b: f64,
    pub scale_m: f64,
    pub time_data: TimeData,
    pub values: BlockValues,
}

impl TscBlock {
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Encodes the block to its on-disk representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match &self.time_data {
            TimeData::Timestamps(times) => {
                body.put_u32_le(times.len() as u32);
                for t in times {
                    body.put_i64_le(*t);
                }
            }
            TimeData::GapArray(gaps) => {
                body.put_u32_le(gaps.len() as u32);
                for (index, duration) in gaps {
                    body.put_i64_le(*index);
                    body.put_i64_le(*duration);
                }
            }
        }
        match &self.values {
            BlockValues::Int64(values) => {
                for v in values {
                    body.put_i64_le(*v);
                }
            }
            BlockValues::Float64(values) => {
                for v in values {
                    body.put_f64_le(*v);
                }
            }
        }

        let compressed = lz4::block::compress(&body, None, true)
            .map_err(|e| Error::StorageEngine(format!("lz4 compression failed: {e}")))?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(TSC_BLOCK_HEADER_SIZE + compressed.len());
        out.put_u8(TSC_BLOCK_VERSION);
        out.put_u8(self.time_data.type_code());
        out.put_u8(self.values.type_code());
        out.put_u8(0);
        out.put_u32_le(self.values.len() as u32);
        out.put_i64_le(self.start_time_n);
        out.put_i64_le(self.end_time_n);
        out.put_f64_le(self.scale_b);
        out.put_f64_le(self.scale_m);
        out.put_u32_le(crc);
        out.put_u32_le(compressed.len() as u32);
        out.extend_from_slice(&compressed);

        Ok(out)
    }

    /// Decodes one block from the front of `data`, returning it with its
    /// total encoded size
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < TSC_BLOCK_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "TSC block header too small: {} bytes (expected {})",
                data.len(),
                TSC_BLOCK_HEADER_SIZE
            )));
        }

        let mut cursor = data;
        let version = cursor.get_u8();
        if version != TSC_BLOCK_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported TSC block version: {version}"
            )));
        }
        let time_type = cursor.get_u8();
        let value_type = cursor.get_u8();
        let _flags = cursor.get_u8();
        let num_values = cursor.get_u32_le() as usize;
        let start_time_n = cursor.get_i64_le();
        let end_time_n = cursor.get_i64_le();
        let scale_b = cursor.get_f64_le();
        let scale_m = cursor.get_f64_le();
        let expected_crc = cursor.get_u32_le();
        let body_len = cursor.get_u32_le() as usize;

        if data.len() < TSC_BLOCK_HEADER_SIZE + body_len {
            return Err(Error::Corruption(format!(
                "TSC block body truncated: {} of {} bytes",
                data.len() - TSC_BLOCK_HEADER_SIZE,
                body_len
            )));
        }
        let compressed = &data[TSC_BLOCK_HEADER_SIZE..TSC_BLOCK_HEADER_SIZE + body_len];

        let mut hasher = Hasher::new();
        hasher.update(compressed);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            return Err(Error::ChecksumMismatch(format!(
                "TSC block body crc: expected {expected_crc:#x}, got {actual_crc:#x}"
            )));
        }

        let body = lz4::block::decompress(compressed, None)
            .map_err(|e| Error::Corruption(format!("lz4 decompression failed: {e}")))?;
        let mut body = body.as_slice();

        if body.remaining() < 4 {
            return Err(Error::Corruption(
                "TSC block body shorter than its time-entry count".to_string(),
            ));
        }
        let n_time_entries = body.get_u32_le() as usize;
        let time_entry_size = match time_type {
            T_TYPE_TIMESTAMP_ARRAY => 8,
            T_TYPE_GAP_ARRAY => 16,
            other => {
                return Err(Error::Corruption(format!(
                    "invalid TSC block time type: {other}"
                )))
            }
        };
        if body.remaining() < n_time_entries * time_entry_size + num_values * 8 {
            return Err(Error::Corruption(
                "TSC block body shorter than its declared contents".to_string(),
            ));
        }

        let time_data = match time_type {
            T_TYPE_TIMESTAMP_ARRAY => {
                let mut times = Vec::with_capacity(n_time_entries);
                for _ in 0..n_time_entries {
                    times.push(body.get_i64_le());
                }
                TimeData::Timestamps(times)
            }
            _ => {
                let mut gaps = Vec::with_capacity(n_time_entries);
                for _ in 0..n_time_entries {
                    gaps.push((body.get_i64_le(), body.get_i64_le()));
                }
                TimeData::GapArray(gaps)
            }
        };

        let values = match value_type {
            V_TYPE_INT64 => {
                let mut values = Vec::with_capacity(num_values);
                for _ in 0..num_values {
                    values.push(body.get_i64_le());
                }
                BlockValues::Int64(values)
            }
            V_TYPE_DOUBLE => {
                let mut values = Vec::with_capacity(num_values);
                for _ in 0..num_values {
                    values.push(body.get_f64_le());
                }
                BlockValues::Float64(values)
            }
            other => {
                return Err(Error::Corruption(format!(
                    "invalid TSC block value type: {other}"
                )))
            }
        };

        Ok((
            Self {
                start_time_n,
                end_time_n,
                scale_b,
                scale_m,
                time_data,
                values,
            },
            TSC_BLOCK_HEADER_SIZE + body_len,
        ))
    }
}
