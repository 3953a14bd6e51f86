use crate::{Error, Result};

use bytes::{Buf, BufMut};
use serde::Deserialize;

/// Nanoseconds since the Unix epoch
pub type Nanos = i64;

/// Durability level for WAL writes
///
/// - `None`: writes stay in the userspace buffer until a flush is requested
/// - `Normal`: `flush()` pushes buffered data to the OS page cache
/// - `Full`: `flush()` and `close()` additionally fsync to stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    None,
    Normal,
    Full,
}

/// How records are laid out in a WAL file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueMode {
    /// One `(nominal_time, server_time, value)` record per sample
    TimeValuePairs = 0,
    /// One record per message carrying a run of samples
    Intervals = 1,
}

impl TryFrom<u8> for ValueMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueMode::TimeValuePairs),
            1 => Ok(ValueMode::Intervals),
            other => Err(Error::Corruption(format!(
                "invalid value mode: {other} (expected 0 or 1)"
            ))),
        }
    }
}

/// Element type of the values stored in a WAL file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Float32 = 0,
    Float64 = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
}

impl ValueType {
    /// Width of one element in bytes
    pub const fn size_of(self) -> usize {
        match self {
            ValueType::Float32 => 4,
            ValueType::Float64 => 8,
            ValueType::Int8 => 1,
            ValueType::Int16 => 2,
            ValueType::Int32 => 4,
            ValueType::Int64 => 8,
        }
    }

    /// Whether this is one of the integer widths
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            ValueType::Int8 | ValueType::Int16 | ValueType::Int32 | ValueType::Int64
        )
    }
}

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueType::Float32),
            1 => Ok(ValueType::Float64),
            2 => Ok(ValueType::Int8),
            3 => Ok(ValueType::Int16),
            4 => Ok(ValueType::Int32),
            5 => Ok(ValueType::Int64),
            other => Err(Error::Corruption(format!(
                "invalid value type: {other} (expected 0..=5)"
            ))),
        }
    }
}

/// How stored values map back to physical units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScaleType {
    None = 0,
    /// `physical = stored * scale_1 + scale_0`
    Linear = 1,
}

impl TryFrom<u8> for ScaleType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ScaleType::None),
            1 => Ok(ScaleType::Linear),
            other => Err(Error::Corruption(format!(
                "invalid scale type: {other} (expected 0 or 1)"
            ))),
        }
    }
}

/// Outcome of handing a merged payload to the ingest callback
///
/// The numeric codes are part of the pipeline contract: source WAL files are
/// deleted for every status except `Corrupt`, and `Fatal` sets the
/// process-wide shutdown flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Ok,
    Duplicate,
    Empty,
    Corrupt,
    Fatal,
}

impl IngestStatus {
    /// Numeric wire code for the status
    pub const fn code(self) -> i32 {
        match self {
            IngestStatus::Ok => 0,
            IngestStatus::Duplicate => 1,
            IngestStatus::Empty => 2,
            IngestStatus::Corrupt => -1,
            IngestStatus::Fatal => -2,
        }
    }
}

/// A single typed sample value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Float32(f32),
    Float64(f64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
}

impl Value {
    pub const fn value_type(self) -> ValueType {
        match self {
            Value::Float32(_) => ValueType::Float32,
            Value::Float64(_) => ValueType::Float64,
            Value::Int8(_) => ValueType::Int8,
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
        }
    }

    /// Appends the little-endian encoding of this value to `buf`
    pub fn write_to(self, buf: &mut impl BufMut) {
        match self {
            Value::Float32(v) => buf.put_f32_le(v),
            Value::Float64(v) => buf.put_f64_le(v),
            Value::Int8(v) => buf.put_i8(v),
            Value::Int16(v) => buf.put_i16_le(v),
            Value::Int32(v) => buf.put_i32_le(v),
            Value::Int64(v) => buf.put_i64_le(v),
        }
    }
}

/// A homogeneous array of sample values
///
/// This is the in-memory form of the value stream of a WAL file: one variant
/// per supported element type, little-endian on the wire. All cross-type
/// operations (`append`, comparisons) require matching variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueArray {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
}

impl ValueArray {
    /// Creates an empty array of the given element type
    pub fn new(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Float32 => ValueArray::Float32(Vec::new()),
            ValueType::Float64 => ValueArray::Float64(Vec::new()),
            ValueType::Int8 => ValueArray::Int8(Vec::new()),
            ValueType::Int16 => ValueArray::Int16(Vec::new()),
            ValueType::Int32 => ValueArray::Int32(Vec::new()),
            ValueType::Int64 => ValueArray::Int64(Vec::new()),
        }
    }

    /// Creates an empty array with room for `capacity` elements
    pub fn with_capacity(value_type: ValueType, capacity: usize) -> Self {
        match value_type {
            ValueType::Float32 => ValueArray::Float32(Vec::with_capacity(capacity)),
            ValueType::Float64 => ValueArray::Float64(Vec::with_capacity(capacity)),
            ValueType::Int8 => ValueArray::Int8(Vec::with_capacity(capacity)),
            ValueType::Int16 => ValueArray::Int16(Vec::with_capacity(capacity)),
            ValueType::Int32 => ValueArray::Int32(Vec::with_capacity(capacity)),
            ValueType::Int64 => ValueArray::Int64(Vec::with_capacity(capacity)),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            ValueArray::Float32(_) => ValueType::Float32,
            ValueArray::Float64(_) => ValueType::Float64,
            ValueArray::Int8(_) => ValueType::Int8,
            ValueArray::Int16(_) => ValueType::Int16,
            ValueArray::Int32(_) => ValueType::Int32,
            ValueArray::Int64(_) => ValueType::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ValueArray::Float32(v) => v.len(),
            ValueArray::Float64(v) => v.len(),
            ValueArray::Int8(v) => v.len(),
            ValueArray::Int16(v) => v.len(),
            ValueArray::Int32(v) => v.len(),
            ValueArray::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a scalar of the matching type
    pub fn push(&mut self, value: Value) -> Result<()> {
        match (self, value) {
            (ValueArray::Float32(v), Value::Float32(x)) => v.push(x),
            (ValueArray::Float64(v), Value::Float64(x)) => v.push(x),
            (ValueArray::Int8(v), Value::Int8(x)) => v.push(x),
            (ValueArray::Int16(v), Value::Int16(x)) => v.push(x),
            (ValueArray::Int32(v), Value::Int32(x)) => v.push(x),
            (ValueArray::Int64(v), Value::Int64(x)) => v.push(x),
            (arr, value) => {
                return Err(Error::TypeMismatch {
                    expected: arr.value_type(),
                    found: value.value_type(),
                })
            }
        }
        Ok(())
    }

    /// Appends all elements of `other`, which must share this element type
    pub fn append(&mut self, other: &ValueArray) -> Result<()> {
        match (self, other) {
            (ValueArray::Float32(a), ValueArray::Float32(b)) => a.extend_from_slice(b),
            (ValueArray::Float64(a), ValueArray::Float64(b)) => a.extend_from_slice(b),
            (ValueArray::Int8(a), ValueArray::Int8(b)) => a.extend_from_slice(b),
            (ValueArray::Int16(a), ValueArray::Int16(b)) => a.extend_from_slice(b),
            (ValueArray::Int32(a), ValueArray::Int32(b)) => a.extend_from_slice(b),
            (ValueArray::Int64(a), ValueArray::Int64(b)) => a.extend_from_slice(b),
            (arr, other) => {
                return Err(Error::TypeMismatch {
                    expected: arr.value_type(),
                    found: other.value_type(),
                })
            }
        }
        Ok(())
    }

    /// Shortens the array to `len` elements
    pub fn truncate(&mut self, len: usize) {
        match self {
            ValueArray::Float32(v) => v.truncate(len),
            ValueArray::Float64(v) => v.truncate(len),
            ValueArray::Int8(v) => v.truncate(len),
            ValueArray::Int16(v) => v.truncate(len),
            ValueArray::Int32(v) => v.truncate(len),
            ValueArray::Int64(v) => v.truncate(len),
        }
    }

    /// Reads `count` little-endian elements from `buf`, appending them
    ///
    /// The caller must have verified that `buf` holds at least
    /// `count * value_type.size_of()` bytes.
    pub fn extend_from_buf(&mut self, buf: &mut impl Buf, count: usize) {
        match self {
            ValueArray::Float32(v) => (0..count).for_each(|_| v.push(buf.get_f32_le())),
            ValueArray::Float64(v) => (0..count).for_each(|_| v.push(buf.get_f64_le())),
            ValueArray::Int8(v) => (0..count).for_each(|_| v.push(buf.get_i8())),
            ValueArray::Int16(v) => (0..count).for_each(|_| v.push(buf.get_i16_le())),
            ValueArray::Int32(v) => (0..count).for_each(|_| v.push(buf.get_i32_le())),
            ValueArray::Int64(v) => (0..count).for_each(|_| v.push(buf.get_i64_le())),
        }
    }

    /// Appends the little-endian encoding of elements `start..end` to `buf`
    pub fn write_range_to(&self, buf: &mut impl BufMut, start: usize, end: usize) {
        match self {
            ValueArray::Float32(v) => v[start..end].iter().for_each(|x| buf.put_f32_le(*x)),
            ValueArray::Float64(v) => v[start..end].iter().for_each(|x| buf.put_f64_le(*x)),
            ValueArray::Int8(v) => v[start..end].iter().for_each(|x| buf.put_i8(*x)),
            ValueArray::Int16(v) => v[start..end].iter().for_each(|x| buf.put_i16_le(*x)),
            ValueArray::Int32(v) => v[start..end].iter().for_each(|x| buf.put_i32_le(*x)),
            ValueArray::Int64(v) => v[start..end].iter().for_each(|x| buf.put_i64_le(*x)),
        }
    }

    /// Appends the little-endian encoding of every element to `buf`
    pub fn write_to(&self, buf: &mut impl BufMut) {
        self.write_range_to(buf, 0, self.len());
    }

    /// Gathers the given element ranges, in order, into a new array
    pub fn extract(&self, ranges: &[std::ops::Range<usize>]) -> ValueArray {
        let total = ranges.iter().map(|r| r.len()).sum();
        let mut out = ValueArray::with_capacity(self.value_type(), total);
        for range in ranges {
            match (&mut out, self) {
                (ValueArray::Float32(o), ValueArray::Float32(v)) => {
                    o.extend_from_slice(&v[range.clone()])
                }
                (ValueArray::Float64(o), ValueArray::Float64(v)) => {
                    o.extend_from_slice(&v[range.clone()])
                }
                (ValueArray::Int8(o), ValueArray::Int8(v)) => o.extend_from_slice(&v[range.clone()]),
                (ValueArray::Int16(o), ValueArray::Int16(v)) => {
                    o.extend_from_slice(&v[range.clone()])
                }
                (ValueArray::Int32(o), ValueArray::Int32(v)) => {
                    o.extend_from_slice(&v[range.clone()])
                }
                (ValueArray::Int64(o), ValueArray::Int64(v)) => {
                    o.extend_from_slice(&v[range.clone()])
                }
                _ => unreachable!("extract output shares the input type"),
            }
        }
        out
    }

    /// Widens every element to f64
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            ValueArray::Float32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            ValueArray::Float64(v) => v.clone(),
            ValueArray::Int8(v) => v.iter().map(|x| f64::from(*x)).collect(),
            ValueArray::Int16(v) => v.iter().map(|x| f64::from(*x)).collect(),
            ValueArray::Int32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            ValueArray::Int64(v) => v.iter().map(|x| *x as f64).collect(),
        }
    }

    /// Widens every element to i64; only valid for the integer types
    pub fn to_i64(&self) -> Result<Vec<i64>> {
        match self {
            ValueArray::Int8(v) => Ok(v.iter().map(|x| i64::from(*x)).collect()),
            ValueArray::Int16(v) => Ok(v.iter().map(|x| i64::from(*x)).collect()),
            ValueArray::Int32(v) => Ok(v.iter().map(|x| i64::from(*x)).collect()),
            ValueArray::Int64(v) => Ok(v.clone()),
            other => Err(Error::TypeMismatch {
                expected: ValueType::Int64,
                found: other.value_type(),
            }),
        }
    }
}
