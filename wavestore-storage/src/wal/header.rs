//! WAL file header and stream fingerprinting
//!
//! Every WAL file begins with a packed 249-byte header describing the stream
//! it belongs to. The header doubles as the identity of the stream: its
//! canonical encoding is hashed into a 128-bit fingerprint that keys the
//! writer pool and prefixes the filename.

use crate::format::{FileHeader, ValidateFile};
use wavestore_core::{Error, Result, ScaleType, ValueMode, ValueType};

use bytes::{Buf, BufMut};
use xxhash_rust::xxh3::xxh3_128;

use std::fmt;
use std::str::FromStr;

/// Current WAL format version
pub const WAL_CURRENT_VERSION: u8 = 1;

/// Versions this build can read
pub const WAL_SUPPORTED_VERSIONS: &[u8] = &[1];

/// Size of the packed WAL header in bytes
pub const WAL_HEADER_SIZE: usize = 249;

/// Length of the fixed name fields (`device_name`, `measure_name`,
/// `measure_units`)
pub const NAME_FIELD_LEN: usize = 64;

/// WAL file header
///
/// Packed little-endian, no padding:
///
/// ```text
/// Offset  Size  Field                Description
/// ------  ----  -----                -----------
/// 0       1     version              Format version (1)
/// 1       64    device_name          NUL-padded UTF-8
/// 65      8     sample_freq          Sample rate in nano-hertz; 0 = aperiodic
/// 73      1     input_value_type     Element type as stored on disk
/// 74      1     true_value_type      Element type after unscaling
/// 75      1     mode                 0 = time-value pairs, 1 = intervals
/// 76      4     samples_per_message  0 = variable-length messages
/// 80      8     file_start_time      Bucketed start time (ns since epoch)
/// 88      1     scale_type           0 = none, 1 = linear
/// 89      8     scale_0              Linear offset (b)
/// 97      8     scale_1              Linear slope (m)
/// 105     8     scale_2              Reserved
/// 113     8     scale_3              Reserved
/// 121     64    measure_name         NUL-padded UTF-8
/// 185     64    measure_units        NUL-padded UTF-8
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WALHeader {
    pub version: u8,
    pub device_name: [u8; NAME_FIELD_LEN],
    pub sample_freq: u64,
    pub input_value_type: ValueType,
    pub true_value_type: ValueType,
    pub mode: ValueMode,
    pub samples_per_message: u32,
    pub file_start_time: i64,
    pub scale_type: ScaleType,
    pub scale_0: f64,
    pub scale_1: f64,
    pub scale_2: f64,
    pub scale_3: f64,
    pub measure_name: [u8; NAME_FIELD_LEN],
    pub measure_units: [u8; NAME_FIELD_LEN],
}

impl WALHeader {
    /// Packs a string into a NUL-padded 64-byte name field
    pub fn pack_name(name: &str) -> Result<[u8; NAME_FIELD_LEN]> {
        let bytes = name.as_bytes();
        if bytes.len() > NAME_FIELD_LEN {
            return Err(Error::Corruption(format!(
                "name '{name}' exceeds {NAME_FIELD_LEN} bytes"
            )));
        }
        let mut field = [0u8; NAME_FIELD_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(field)
    }

    /// Decodes a NUL-padded name field back to a string
    pub fn unpack_name(field: &[u8; NAME_FIELD_LEN]) -> String {
        let end = field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_FIELD_LEN);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    pub fn device_name(&self) -> String {
        Self::unpack_name(&self.device_name)
    }

    pub fn measure_name(&self) -> String {
        Self::unpack_name(&self.measure_name)
    }

    pub fn measure_units(&self) -> String {
        Self::unpack_name(&self.measure_units)
    }

    /// Fingerprint of this header's canonical encoding
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_header(self)
    }
}

impl FileHeader for WALHeader {
    const FORMAT_NAME: &'static str = "WAL";
    const SUPPORTED_VERSIONS: &'static [u8] = WAL_SUPPORTED_VERSIONS;
    const HEADER_SIZE: usize = WAL_HEADER_SIZE;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE);

        buf.put_u8(self.version);
        buf.put_slice(&self.device_name);
        buf.put_u64_le(self.sample_freq);
        buf.put_u8(self.input_value_type as u8);
        buf.put_u8(self.true_value_type as u8);
        buf.put_u8(self.mode as u8);
        buf.put_u32_le(self.samples_per_message);
        buf.put_i64_le(self.file_start_time);
        buf.put_u8(self.scale_type as u8);
        buf.put_f64_le(self.scale_0);
        buf.put_f64_le(self.scale_1);
        buf.put_f64_le(self.scale_2);
        buf.put_f64_le(self.scale_3);
        buf.put_slice(&self.measure_name);
        buf.put_slice(&self.measure_units);

        debug_assert_eq!(buf.len(), Self::HEADER_SIZE);
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "WAL header too small: {} bytes (expected {})",
                data.len(),
                Self::HEADER_SIZE
            )));
        }

        let mut cursor = data;

        let version = cursor.get_u8();
        let mut device_name = [0u8; NAME_FIELD_LEN];
        cursor.copy_to_slice(&mut device_name);
        let sample_freq = cursor.get_u64_le();
        let input_value_type = ValueType::try_from(cursor.get_u8())?;
        let true_value_type = ValueType::try_from(cursor.get_u8())?;
        let mode = ValueMode::try_from(cursor.get_u8())?;
        let samples_per_message = cursor.get_u32_le();
        let file_start_time = cursor.get_i64_le();
        let scale_type = ScaleType::try_from(cursor.get_u8())?;
        let scale_0 = cursor.get_f64_le();
        let scale_1 = cursor.get_f64_le();
        let scale_2 = cursor.get_f64_le();
        let scale_3 = cursor.get_f64_le();
        let mut measure_name = [0u8; NAME_FIELD_LEN];
        cursor.copy_to_slice(&mut measure_name);
        let mut measure_units = [0u8; NAME_FIELD_LEN];
        cursor.copy_to_slice(&mut measure_units);

        let header = Self {
            version,
            device_name,
            sample_freq,
            input_value_type,
            true_value_type,
            mode,
            samples_per_message,
            file_start_time,
            scale_type,
            scale_0,
            scale_1,
            scale_2,
            scale_3,
            measure_name,
            measure_units,
        };

        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if !self.is_version_supported() {
            return Err(Error::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    fn version(&self) -> u8 {
        self.version
    }
}

impl ValidateFile for WALHeader {}

/// 128-bit hash of a header's canonical encoding
///
/// Fingerprints group WAL files by stream: the writer prefixes filenames
/// with the fingerprint and the read manager keys batches by the same
/// prefix. They are pure values and may be freely copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Computes the fingerprint of a header
    pub fn of_header(header: &WALHeader) -> Self {
        Fingerprint(xxh3_128(&header.encode()))
    }

    /// Parses a fingerprint from its 32-char lowercase hex rendering
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(Error::Corruption(format!(
                "fingerprint '{s}' is not 32 hex chars"
            )));
        }
        let raw = u128::from_str_radix(s, 16)
            .map_err(|_| Error::Corruption(format!("fingerprint '{s}' is not hex")))?;
        Ok(Fingerprint(raw))
    }

    /// Extracts the fingerprint from a WAL filename
    /// (`<hex128>-<suffix>.wal`); `None` for foreign filenames
    pub fn from_file_name(name: &str) -> Option<Self> {
        let prefix = name.split('-').next()?;
        Self::from_hex(prefix).ok()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}
