// 1. Local crate imports
use super::header::WALHeader;
use super::payload::WALPayload;
use crate::format::FileHeader;
use wavestore_core::Result;

// 2. External crate imports
// (none in this file)

// 3. Standard library imports
use std::fs;
use std::path::{Path, PathBuf};

/// Reader for one WAL file
///
/// Loads the whole file into memory and decodes it in one pass. Files
/// shorter than a header are reported as `None`; they carry no recoverable
/// data and the pipeline deletes them as empty.
pub struct WALReader {
    path: PathBuf,
}

impl WALReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decodes the entire file
    ///
    /// Returns `Ok(None)` for files shorter than one header. Truncated
    /// record tails are handled by the payload decoder.
    pub fn read_all(&self) -> Result<Option<WALPayload>> {
        let bytes = fs::read(&self.path)?;
        if bytes.len() < WALHeader::HEADER_SIZE {
            return Ok(None);
        }
        WALPayload::decode(&bytes).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::writer::WALWriter;
    use wavestore_core::{ScaleType, SyncMode, Value, ValueMode, ValueType};

    use tempfile::TempDir;

    fn metric_header() -> WALHeader {
        WALHeader {
            version: 1,
            device_name: WALHeader::pack_name("pump-2").unwrap(),
            sample_freq: 0,
            input_value_type: ValueType::Float64,
            true_value_type: ValueType::Float64,
            mode: ValueMode::TimeValuePairs,
            samples_per_message: 1,
            file_start_time: 0,
            scale_type: ScaleType::None,
            scale_0: 0.0,
            scale_1: 0.0,
            scale_2: 0.0,
            scale_3: 0.0,
            measure_name: WALHeader::pack_name("RR").unwrap(),
            measure_units: WALHeader::pack_name("breaths/min").unwrap(),
        }
    }

    #[test]
    fn read_all_returns_written_records() {
        let tmp = TempDir::new().unwrap();
        let mut writer = WALWriter::create(tmp.path(), "r.wal", SyncMode::Normal).unwrap();
        writer.write_header(&metric_header()).unwrap();
        for i in 0..5 {
            writer
                .write_time_value_pair(i * 1000, i * 1000 + 3, Value::Float64(i as f64))
                .unwrap();
        }
        writer.close().unwrap();

        let payload = WALReader::new(tmp.path().join("r.wal"))
            .read_all()
            .unwrap()
            .unwrap();
        assert_eq!(payload.num_messages(), 5);
        assert_eq!(payload.nominal_times, vec![0, 1000, 2000, 3000, 4000]);
    }

    #[test]
    fn read_all_returns_none_for_sub_header_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.wal");
        std::fs::write(&path, [0u8; 16]).unwrap();

        assert!(WALReader::new(&path).read_all().unwrap().is_none());
    }

    #[test]
    fn read_all_propagates_missing_file_error() {
        let reader = WALReader::new("/nonexistent/path/to.wal");
        assert!(reader.read_all().is_err());
    }
}
