// 1. Local crate imports
use super::header::{Fingerprint, WALHeader};
use crate::format::FileHeader;
use wavestore_core::{Error, Result, SyncMode, Value, ValueArray, ValueMode, ValueType};

// 2. External crate imports
use bytes::BufMut;

// 3. Standard library imports
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Filename suffix following the fingerprint prefix
///
/// A WAL filename is `<fingerprint>-<suffix>.wal`. The suffix only has to
/// make the name unique within the directory; producers usually let the
/// writer pick a random one.
#[derive(Debug, Clone)]
pub enum FileSuffix {
    /// A random 64-bit integer
    Random,
    Number(u64),
    Text(String),
    /// Another stream's fingerprint, for files derived from a second header
    Fingerprint(Fingerprint),
}

/// Builds the canonical WAL filename for a fingerprint and suffix
pub fn wal_file_name(fingerprint: Fingerprint, suffix: &FileSuffix) -> String {
    match suffix {
        FileSuffix::Random => format!("{fingerprint}-{}.wal", rand::random::<u64>()),
        FileSuffix::Number(n) => format!("{fingerprint}-{n}.wal"),
        FileSuffix::Text(s) => format!("{fingerprint}-{s}.wal"),
        FileSuffix::Fingerprint(fp) => format!("{fingerprint}-{fp}.wal"),
    }
}

/// Append-only writer for one WAL file
///
/// A writer is bound to a single header: `write_header` must be the first
/// operation and memoizes the value type and stride that every subsequent
/// record is checked against. Writes are buffered; durability is governed by
/// [`SyncMode`]. The pipeline's correctness relies on batch quiescence time
/// exceeding producer burst periods, not on per-record fsync.
///
/// `close()` is idempotent and also runs on drop (best-effort).
pub struct WALWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    sync_mode: SyncMode,
    value_type: Option<ValueType>,
    samples_per_message: u32,
    mode: Option<ValueMode>,
    bytes_written: u64,
}

impl WALWriter {
    /// Creates (or truncates) `dir/filename`
    ///
    /// The caller guarantees filename uniqueness; the directory is created
    /// if missing.
    pub fn create(
        dir: impl AsRef<Path>,
        filename: &str,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        let file = File::create(&path)?;

        Ok(Self {
            file: Some(BufWriter::new(file)),
            path,
            sync_mode,
            value_type: None,
            samples_per_message: 0,
            mode: None,
            bytes_written: 0,
        })
    }

    /// Creates a writer named after `header`'s fingerprint and writes the
    /// header as the first record
    pub fn create_for_header(
        dir: impl AsRef<Path>,
        header: &WALHeader,
        suffix: FileSuffix,
        sync_mode: SyncMode,
    ) -> Result<(Self, String)> {
        let filename = wal_file_name(header.fingerprint(), &suffix);
        let mut writer = Self::create(dir, &filename, sync_mode)?;
        writer.write_header(header)?;
        Ok((writer, filename))
    }

    /// Writes the file header; must be the first operation
    ///
    /// Memoizes the header's value type, mode and stride for later record
    /// validation.
    pub fn write_header(&mut self, header: &WALHeader) -> Result<()> {
        if !WALHeader::SUPPORTED_VERSIONS.contains(&header.version) {
            return Err(Error::UnsupportedVersion(header.version));
        }

        self.value_type = Some(header.input_value_type);
        self.samples_per_message = header.samples_per_message;
        self.mode = Some(header.mode);

        self.write_bytes(&header.encode())
    }

    /// Appends one time-value-pair record
    pub fn write_time_value_pair(
        &mut self,
        time_nominal: i64,
        time_server: i64,
        value: Value,
    ) -> Result<()> {
        let expected = self.expect_header()?;
        if self.mode != Some(ValueMode::TimeValuePairs) {
            return Err(Error::StorageEngine(
                "time-value record in an interval-mode WAL file".to_string(),
            ));
        }
        if value.value_type() != expected {
            return Err(Error::TypeMismatch {
                expected,
                found: value.value_type(),
            });
        }

        let mut buf = Vec::with_capacity(16 + expected.size_of());
        buf.put_i64_le(time_nominal);
        buf.put_i64_le(time_server);
        value.write_to(&mut buf);
        self.write_bytes(&buf)
    }

    /// Appends one interval record
    ///
    /// `num_values` defaults to `values.len()`. All values are written
    /// regardless of `num_values`, matching the fixed-stride layout where a
    /// short message still occupies a full record.
    pub fn write_interval_message(
        &mut self,
        start_time_nominal: i64,
        start_time_server: i64,
        values: &ValueArray,
        num_values: Option<u32>,
        null_offset: u32,
    ) -> Result<()> {
        let expected = self.expect_header()?;
        if self.mode != Some(ValueMode::Intervals) {
            return Err(Error::StorageEngine(
                "interval record in a time-value-pair WAL file".to_string(),
            ));
        }
        if values.value_type() != expected {
            return Err(Error::TypeMismatch {
                expected,
                found: values.value_type(),
            });
        }
        if self.samples_per_message > 0 && values.len() != self.samples_per_message as usize {
            return Err(Error::Corruption(format!(
                "{} values in a fixed-stride message of {}",
                values.len(),
                self.samples_per_message
            )));
        }
        let num_values = num_values.unwrap_or(values.len() as u32);

        let mut buf = Vec::with_capacity(24 + values.len() * expected.size_of());
        buf.put_i64_le(start_time_nominal);
        buf.put_i64_le(start_time_server);
        buf.put_u32_le(num_values);
        buf.put_u32_le(null_offset);
        values.write_to(&mut buf);
        self.write_bytes(&buf)
    }

    /// Bulk-appends already-encoded bytes
    pub fn write_payload(&mut self, prepared: &[u8]) -> Result<()> {
        self.write_bytes(prepared)
    }

    /// Pushes buffered data to the OS; fsyncs under [`SyncMode::Full`]
    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            if self.sync_mode == SyncMode::Full {
                file.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    /// Flushes and closes the file; safe to call more than once
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            if self.sync_mode == SyncMode::Full {
                file.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes appended so far, header included
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn expect_header(&self) -> Result<ValueType> {
        self.value_type.ok_or_else(|| {
            Error::StorageEngine("record written before the WAL header".to_string())
        })
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::StorageEngine("write to a closed WAL writer".to_string()))?;
        file.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

impl Drop for WALWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
