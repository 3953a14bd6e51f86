//! WAL payload codec
//!
//! A WAL file is a packed header followed by an append sequence of records.
//! Two record layouts exist:
//!
//! ```text
//! TIME_VALUE_PAIRS (mode 0):
//!   nominal_time: i64 | server_time: i64 | value: T
//!
//! INTERVALS (mode 1):
//!   start_time_nominal: i64 | start_time_server: i64 |
//!   num_values: u32 | null_offset: u32 | values: T[...]
//! ```
//!
//! With `samples_per_message > 0` every interval record carries exactly that
//! many values (fixed stride); with `samples_per_message == 0` each record
//! carries `num_values` values (variable stride). All integers are
//! little-endian, `T` is determined by the header's `input_value_type`.
//!
//! ## Truncation recovery
//!
//! Files may end mid-record after a crash. Fixed-stride decoding drops any
//! trailing byte count smaller than one record. Variable-stride decoding
//! walks records one by one and stops at the first message whose declared
//! values would run past EOF, recording that message with zero samples.

use super::header::WALHeader;
use crate::format::FileHeader;
use wavestore_core::{Error, Result, ValueArray, ValueMode};

use bytes::{Buf, BufMut};

/// Size of the fixed prefix of an interval record
/// (two i64 times + num_values + null_offset)
pub const INTERVAL_MESSAGE_PREFIX_SIZE: usize = 24;

/// Size of the time fields of a time-value-pair record
pub const TIME_VALUE_PREFIX_SIZE: usize = 16;

/// Decoded contents of one WAL file
///
/// Parallel arrays indexed by message: `nominal_times`, `server_times` and
/// (for interval files) `message_sizes` / `null_offsets` have one entry per
/// message, while `values` holds every sample concatenated in message order.
#[derive(Debug, Clone, PartialEq)]
pub struct WALPayload {
    pub header: WALHeader,
    pub nominal_times: Vec<i64>,
    pub server_times: Vec<i64>,
    pub values: ValueArray,
    pub message_sizes: Option<Vec<u32>>,
    pub null_offsets: Option<Vec<u32>>,
}

impl WALPayload {
    /// Builds a time-value-pair payload
    ///
    /// All three arrays must have the same length and the values must match
    /// the header's `input_value_type`.
    pub fn from_time_value_data(
        header: WALHeader,
        nominal_times: Vec<i64>,
        server_times: Vec<i64>,
        values: ValueArray,
    ) -> Result<Self> {
        if header.mode != ValueMode::TimeValuePairs {
            return Err(Error::Corruption(
                "header mode is not TIME_VALUE_PAIRS".to_string(),
            ));
        }
        if values.value_type() != header.input_value_type {
            return Err(Error::TypeMismatch {
                expected: header.input_value_type,
                found: values.value_type(),
            });
        }
        if nominal_times.len() != server_times.len() || nominal_times.len() != values.len() {
            return Err(Error::Corruption(format!(
                "array length mismatch: {} nominal, {} server, {} values",
                nominal_times.len(),
                server_times.len(),
                values.len()
            )));
        }
        Ok(Self {
            header,
            nominal_times,
            server_times,
            values,
            message_sizes: None,
            null_offsets: None,
        })
    }

    /// Builds an interval payload
    ///
    /// `values` holds all samples concatenated in message order. For
    /// fixed-stride headers (`samples_per_message > 0`) every message must
    /// contribute exactly `samples_per_message` values and `message_sizes`
    /// defaults to that stride; for variable-stride headers `message_sizes`
    /// is required. `null_offsets` defaults to zeros.
    pub fn from_interval_data(
        header: WALHeader,
        nominal_times: Vec<i64>,
        server_times: Vec<i64>,
        values: ValueArray,
        message_sizes: Option<Vec<u32>>,
        null_offsets: Option<Vec<u32>>,
    ) -> Result<Self> {
        if header.mode != ValueMode::Intervals {
            return Err(Error::Corruption("header mode is not INTERVALS".to_string()));
        }
        if values.value_type() != header.input_value_type {
            return Err(Error::TypeMismatch {
                expected: header.input_value_type,
                found: values.value_type(),
            });
        }
        let num_messages = nominal_times.len();
        if server_times.len() != num_messages {
            return Err(Error::Corruption(format!(
                "array length mismatch: {} nominal, {} server",
                num_messages,
                server_times.len()
            )));
        }

        let message_sizes = match message_sizes {
            Some(sizes) => {
                if sizes.len() != num_messages {
                    return Err(Error::Corruption(format!(
                        "{} message sizes for {} messages",
                        sizes.len(),
                        num_messages
                    )));
                }
                sizes
            }
            None if header.samples_per_message > 0 => {
                vec![header.samples_per_message; num_messages]
            }
            None => {
                return Err(Error::Corruption(
                    "variable-stride interval data requires message sizes".to_string(),
                ));
            }
        };

        if header.samples_per_message > 0 {
            let expected = num_messages * header.samples_per_message as usize;
            if values.len() != expected {
                return Err(Error::Corruption(format!(
                    "{} values for {} fixed-stride messages of {}",
                    values.len(),
                    num_messages,
                    header.samples_per_message
                )));
            }
        } else {
            let expected: usize = message_sizes.iter().map(|s| *s as usize).sum();
            if values.len() != expected {
                return Err(Error::Corruption(format!(
                    "{} values but message sizes sum to {}",
                    values.len(),
                    expected
                )));
            }
        }

        let null_offsets = match null_offsets {
            Some(offsets) => {
                if offsets.len() != num_messages {
                    return Err(Error::Corruption(format!(
                        "{} null offsets for {} messages",
                        offsets.len(),
                        num_messages
                    )));
                }
                offsets
            }
            None => vec![0; num_messages],
        };

        Ok(Self {
            header,
            nominal_times,
            server_times,
            values,
            message_sizes: Some(message_sizes),
            null_offsets: Some(null_offsets),
        })
    }

    /// Number of messages (records) in the payload
    pub fn num_messages(&self) -> usize {
        self.nominal_times.len()
    }

    /// Number of samples across all messages
    pub fn num_samples(&self) -> usize {
        self.values.len()
    }

    /// Byte ranges of each message's values within the flat value array
    ///
    /// Only meaningful for interval payloads; time-value pairs are one
    /// sample per message.
    pub fn message_value_ranges(&self) -> Vec<std::ops::Range<usize>> {
        match &self.message_sizes {
            Some(sizes) => {
                let mut ranges = Vec::with_capacity(sizes.len());
                let mut offset = 0usize;
                for size in sizes {
                    let end = offset + *size as usize;
                    ranges.push(offset..end);
                    offset = end;
                }
                ranges
            }
            None => (0..self.values.len()).map(|i| i..i + 1).collect(),
        }
    }

    /// Canonical byte encoding: header followed by one record per message
    pub fn encode(&self) -> Vec<u8> {
        let elem = self.header.input_value_type.size_of();
        let record_prefix = match self.header.mode {
            ValueMode::TimeValuePairs => TIME_VALUE_PREFIX_SIZE,
            ValueMode::Intervals => INTERVAL_MESSAGE_PREFIX_SIZE,
        };
        let body_size = self.num_messages() * record_prefix + self.num_samples() * elem;
        let mut buf = Vec::with_capacity(WALHeader::HEADER_SIZE + body_size);
        buf.extend_from_slice(&self.header.encode());

        match self.header.mode {
            ValueMode::TimeValuePairs => {
                for i in 0..self.num_messages() {
                    buf.put_i64_le(self.nominal_times[i]);
                    buf.put_i64_le(self.server_times[i]);
                    self.values.write_range_to(&mut buf, i, i + 1);
                }
            }
            ValueMode::Intervals => {
                let sizes = self
                    .message_sizes
                    .as_ref()
                    .expect("interval payloads carry message sizes");
                let offsets = self
                    .null_offsets
                    .as_ref()
                    .expect("interval payloads carry null offsets");
                let mut value_offset = 0usize;
                for i in 0..self.num_messages() {
                    let stride = if self.header.samples_per_message > 0 {
                        self.header.samples_per_message as usize
                    } else {
                        sizes[i] as usize
                    };
                    buf.put_i64_le(self.nominal_times[i]);
                    buf.put_i64_le(self.server_times[i]);
                    buf.put_u32_le(sizes[i]);
                    buf.put_u32_le(offsets[i]);
                    self.values
                        .write_range_to(&mut buf, value_offset, value_offset + stride);
                    value_offset += stride;
                }
            }
        }

        buf
    }

    /// Decodes a whole WAL file image
    ///
    /// `data` must be at least one header long; callers treat shorter files
    /// as empty (see `WALReader`). Trailing partial records are dropped per
    /// the module-level truncation policy.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = WALHeader::decode(data)?;
        let body = &data[WALHeader::HEADER_SIZE..];

        match header.mode {
            ValueMode::TimeValuePairs => Self::decode_time_value_pairs(header, body),
            ValueMode::Intervals if header.samples_per_message > 0 => {
                Self::decode_fixed_intervals(header, body)
            }
            ValueMode::Intervals => Self::decode_variable_intervals(header, body),
        }
    }

    fn decode_time_value_pairs(header: WALHeader, body: &[u8]) -> Result<Self> {
        let elem = header.input_value_type.size_of();
        let record_size = TIME_VALUE_PREFIX_SIZE + elem;
        let num_messages = body.len() / record_size;

        let mut nominal_times = Vec::with_capacity(num_messages);
        let mut server_times = Vec::with_capacity(num_messages);
        let mut values = ValueArray::with_capacity(header.input_value_type, num_messages);

        let mut cursor = &body[..num_messages * record_size];
        for _ in 0..num_messages {
            nominal_times.push(cursor.get_i64_le());
            server_times.push(cursor.get_i64_le());
            values.extend_from_buf(&mut cursor, 1);
        }

        Ok(Self {
            header,
            nominal_times,
            server_times,
            values,
            message_sizes: None,
            null_offsets: None,
        })
    }

    fn decode_fixed_intervals(header: WALHeader, body: &[u8]) -> Result<Self> {
        let elem = header.input_value_type.size_of();
        let stride = header.samples_per_message as usize;
        let record_size = INTERVAL_MESSAGE_PREFIX_SIZE + stride * elem;
        let num_messages = body.len() / record_size;

        let mut nominal_times = Vec::with_capacity(num_messages);
        let mut server_times = Vec::with_capacity(num_messages);
        let mut message_sizes = Vec::with_capacity(num_messages);
        let mut null_offsets = Vec::with_capacity(num_messages);
        let mut values =
            ValueArray::with_capacity(header.input_value_type, num_messages * stride);

        let mut cursor = &body[..num_messages * record_size];
        for _ in 0..num_messages {
            nominal_times.push(cursor.get_i64_le());
            server_times.push(cursor.get_i64_le());
            message_sizes.push(cursor.get_u32_le());
            null_offsets.push(cursor.get_u32_le());
            values.extend_from_buf(&mut cursor, stride);
        }

        Ok(Self {
            header,
            nominal_times,
            server_times,
            values,
            message_sizes: Some(message_sizes),
            null_offsets: Some(null_offsets),
        })
    }

    fn decode_variable_intervals(header: WALHeader, body: &[u8]) -> Result<Self> {
        let elem = header.input_value_type.size_of();

        let mut nominal_times = Vec::new();
        let mut server_times = Vec::new();
        let mut message_sizes: Vec<u32> = Vec::new();
        let mut null_offsets = Vec::new();
        let mut values = ValueArray::new(header.input_value_type);

        let mut cursor = 0usize;
        while cursor + INTERVAL_MESSAGE_PREFIX_SIZE < body.len() {
            let mut prefix = &body[cursor..cursor + INTERVAL_MESSAGE_PREFIX_SIZE];
            let nominal = prefix.get_i64_le();
            let server = prefix.get_i64_le();
            let num_values = prefix.get_u32_le();
            let null_offset = prefix.get_u32_le();
            cursor += INTERVAL_MESSAGE_PREFIX_SIZE;

            nominal_times.push(nominal);
            server_times.push(server);
            message_sizes.push(num_values);
            null_offsets.push(null_offset);

            let values_end = cursor + num_values as usize * elem;
            if values_end > body.len() {
                // Message declared more samples than the file holds: keep
                // it as a zero-sample terminator and stop.
                *message_sizes.last_mut().unwrap() = 0;
                break;
            }
            values.extend_from_buf(&mut &body[cursor..values_end], num_values as usize);
            cursor = values_end;
        }

        Ok(Self {
            header,
            nominal_times,
            server_times,
            values,
            message_sizes: Some(message_sizes),
            null_offsets: Some(null_offsets),
        })
    }
}
