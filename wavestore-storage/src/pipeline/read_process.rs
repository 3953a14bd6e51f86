//! Batch read pipeline
//!
//! Pure data flow from a quiescent batch of WAL files to one ingest call:
//! read every file in parallel, merge into a single payload under the first
//! file's header, sort by nominal time with stable first-seen dedup, hand
//! the result to the ingest callback, and unlink the sources only on a
//! non-corrupt outcome. Errors during reading propagate out and leave every
//! file in place, so a failed batch is retried from scratch on a later scan.

use super::locks::{StreamKey, StreamLocks};
use crate::wal::{WALBatch, WALPayload, WALReader};
use wavestore_core::{Error, IngestStatus, Result};

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Downstream consumer of merged payloads
///
/// Implementations map a payload to an [`IngestStatus`]; they must not
/// panic on malformed data, that is what `Corrupt` is for.
pub trait IngestSink: Send + Sync {
    fn ingest(&self, payload: &WALPayload) -> IngestStatus;
}

impl<F> IngestSink for F
where
    F: Fn(&WALPayload) -> IngestStatus + Send + Sync,
{
    fn ingest(&self, payload: &WALPayload) -> IngestStatus {
        self(payload)
    }
}

/// How often a worker re-checks a contended stream lock
const LOCK_POLL: Duration = Duration::from_millis(250);

/// Reads, merges and ingests one batch
///
/// Returns the batch (with `result` filled in) and the stream key whose
/// lock this call acquired, if any; the caller releases it once the result
/// has been observed. Files shorter than a header contribute nothing to the
/// merge but are still deleted with the batch.
pub fn read_batch(
    mut batch: WALBatch,
    ingest: &dyn IngestSink,
    delete_on_ingest: bool,
    locks: Option<&StreamLocks>,
) -> Result<(WALBatch, Option<StreamKey>)> {
    let payloads: Vec<WALPayload> = read_paths(batch.paths())?
        .into_iter()
        .flatten()
        .collect();

    let mut stream_key = None;
    if !payloads.is_empty() {
        let merged = merge_payloads(payloads)?;
        if let Some(locks) = locks {
            let key = StreamKey::of_header(&merged.header);
            locks.acquire_blocking(&key, LOCK_POLL);
            stream_key = Some(key);
        }
        batch.result = Some(ingest.ingest(&merged));
    }

    if delete_on_ingest && batch.result != Some(IngestStatus::Corrupt) {
        if let Err(e) = batch.delete_all() {
            if let (Some(locks), Some(key)) = (locks, &stream_key) {
                locks.release(key);
            }
            return Err(e);
        }
    }

    Ok((batch, stream_key))
}

/// Reads every path on its own thread
///
/// One thread per file, matching the batch's fan-out contract; `None`
/// entries are files shorter than a header.
fn read_paths(paths: &[PathBuf]) -> Result<Vec<Option<WALPayload>>> {
    thread::scope(|scope| {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| scope.spawn(move || WALReader::new(path).read_all()))
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| Error::StorageEngine("WAL file reader panicked".to_string()))?
            })
            .collect()
    })
}

/// Merges payloads sharing a header into one sorted, deduplicated payload
///
/// The first payload's header is authoritative. The output's nominal times
/// are strictly ascending; ties keep the first-seen message and drop the
/// rest, including their values.
pub fn merge_payloads(payloads: Vec<WALPayload>) -> Result<WALPayload> {
    let mut iter = payloads.into_iter();
    let mut merged = iter
        .next()
        .ok_or_else(|| Error::StorageEngine("merge of an empty payload list".to_string()))?;

    for payload in iter {
        merged.nominal_times.extend_from_slice(&payload.nominal_times);
        merged.server_times.extend_from_slice(&payload.server_times);
        merged.values.append(&payload.values)?;

        match (&mut merged.message_sizes, payload.message_sizes) {
            (Some(sizes), Some(more)) => sizes.extend(more),
            (None, None) => {}
            _ => {
                return Err(Error::Corruption(
                    "batch mixes interval and time-value-pair files".to_string(),
                ))
            }
        }
        match (&mut merged.null_offsets, payload.null_offsets) {
            (Some(offsets), Some(more)) => offsets.extend(more),
            (None, None) => {}
            _ => {
                return Err(Error::Corruption(
                    "batch mixes interval and time-value-pair files".to_string(),
                ))
            }
        }
    }

    // Value ranges must be computed against the pre-permutation layout.
    let ranges = merged.message_value_ranges();
    let perm = sort_dedup_permutation(&merged.nominal_times);

    merged.nominal_times = perm.iter().map(|&i| merged.nominal_times[i]).collect();
    merged.server_times = perm.iter().map(|&i| merged.server_times[i]).collect();
    if let Some(sizes) = merged.message_sizes.take() {
        merged.message_sizes = Some(perm.iter().map(|&i| sizes[i]).collect());
    }
    if let Some(offsets) = merged.null_offsets.take() {
        merged.null_offsets = Some(perm.iter().map(|&i| offsets[i]).collect());
    }
    let picked: Vec<std::ops::Range<usize>> = perm.iter().map(|&i| ranges[i].clone()).collect();
    merged.values = merged.values.extract(&picked);

    Ok(merged)
}

/// Message permutation that sorts nominal times ascending and unique
///
/// Stable sort, so ties resolve to the earliest-submitted message; later
/// duplicates are dropped entirely.
fn sort_dedup_permutation(nominal_times: &[i64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..nominal_times.len()).collect();
    indices.sort_by_key(|&i| nominal_times[i]);

    let mut unique = Vec::with_capacity(indices.len());
    let mut last: Option<i64> = None;
    for i in indices {
        let t = nominal_times[i];
        if last != Some(t) {
            unique.push(i);
            last = Some(t);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WALHeader, WALWriter, WAL_CURRENT_VERSION};
    use wavestore_core::{ScaleType, SyncMode, Value, ValueArray, ValueMode, ValueType};

    use tempfile::TempDir;

    use std::sync::Mutex;

    fn pair_header() -> WALHeader {
        WALHeader {
            version: WAL_CURRENT_VERSION,
            device_name: WALHeader::pack_name("monitor-4").unwrap(),
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
            measure_name: WALHeader::pack_name("HR").unwrap(),
            measure_units: WALHeader::pack_name("bpm").unwrap(),
        }
    }

    fn variable_header() -> WALHeader {
        let mut header = pair_header();
        header.mode = ValueMode::Intervals;
        header.samples_per_message = 0;
        header.input_value_type = ValueType::Int16;
        header
    }

    fn pair_payload(times: &[i64], values: &[f64]) -> WALPayload {
        WALPayload::from_time_value_data(
            pair_header(),
            times.to_vec(),
            times.iter().map(|t| t + 1).collect(),
            ValueArray::Float64(values.to_vec()),
        )
        .unwrap()
    }

    struct RecordingSink {
        status: IngestStatus,
        seen: Mutex<Vec<WALPayload>>,
    }

    impl RecordingSink {
        fn new(status: IngestStatus) -> Self {
            Self {
                status,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl IngestSink for RecordingSink {
        fn ingest(&self, payload: &WALPayload) -> IngestStatus {
            self.seen.lock().unwrap().push(payload.clone());
            self.status
        }
    }

    #[test]
    fn merge_sorts_and_dedups_keeping_first_seen() {
        let a = pair_payload(&[30, 10, 20], &[3.0, 1.0, 2.0]);
        let b = pair_payload(&[20, 40], &[99.0, 4.0]);

        let merged = merge_payloads(vec![a, b]).unwrap();

        assert_eq!(merged.nominal_times, vec![10, 20, 30, 40]);
        // The duplicate t=20 from the second file (99.0) is dropped.
        assert_eq!(
            merged.values,
            ValueArray::Float64(vec![1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(merged.server_times, vec![11, 21, 31, 41]);
    }

    #[test]
    fn merge_permutes_variable_interval_slices() {
        let header = variable_header();
        let a = WALPayload::from_interval_data(
            header,
            vec![200, 100],
            vec![201, 101],
            ValueArray::Int16(vec![20, 21, 22, 10]),
            Some(vec![3, 1]),
            Some(vec![0, 5]),
        )
        .unwrap();
        let b = WALPayload::from_interval_data(
            header,
            vec![150],
            vec![151],
            ValueArray::Int16(vec![15, 16]),
            Some(vec![2]),
            None,
        )
        .unwrap();

        let merged = merge_payloads(vec![a, b]).unwrap();

        assert_eq!(merged.nominal_times, vec![100, 150, 200]);
        assert_eq!(merged.message_sizes.as_ref().unwrap(), &vec![1, 2, 3]);
        assert_eq!(merged.null_offsets.as_ref().unwrap(), &vec![5, 0, 0]);
        assert_eq!(
            merged.values,
            ValueArray::Int16(vec![10, 15, 16, 20, 21, 22])
        );
    }

    #[test]
    fn merge_rejects_mixed_modes() {
        let pair = pair_payload(&[1], &[1.0]);
        let interval = WALPayload::from_interval_data(
            variable_header(),
            vec![2],
            vec![2],
            ValueArray::Int16(vec![7]),
            Some(vec![1]),
            None,
        )
        .unwrap();

        assert!(merge_payloads(vec![pair, interval]).is_err());
    }

    fn write_pair_file(dir: &std::path::Path, name: &str, times: &[i64]) {
        let mut writer = WALWriter::create(dir, name, SyncMode::Normal).unwrap();
        writer.write_header(&pair_header()).unwrap();
        for t in times {
            writer
                .write_time_value_pair(*t, t + 1, Value::Float64(*t as f64))
                .unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn read_batch_merges_ingests_and_deletes_on_success() {
        let tmp = TempDir::new().unwrap();
        write_pair_file(tmp.path(), "a.wal", &[10, 30]);
        write_pair_file(tmp.path(), "b.wal", &[20, 30]);

        let mut batch = WALBatch::new(Duration::ZERO, None);
        batch.add(tmp.path().join("a.wal"));
        batch.add(tmp.path().join("b.wal"));

        let sink = RecordingSink::new(IngestStatus::Ok);
        let (batch, _) = read_batch(batch, &sink, true, None).unwrap();

        assert_eq!(batch.result, Some(IngestStatus::Ok));
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].nominal_times, vec![10, 20, 30]);
        assert!(!tmp.path().join("a.wal").exists());
        assert!(!tmp.path().join("b.wal").exists());
    }

    #[test]
    fn read_batch_keeps_files_on_corrupt_status() {
        let tmp = TempDir::new().unwrap();
        write_pair_file(tmp.path(), "a.wal", &[10]);

        let mut batch = WALBatch::new(Duration::ZERO, None);
        batch.add(tmp.path().join("a.wal"));

        let sink = RecordingSink::new(IngestStatus::Corrupt);
        let (batch, _) = read_batch(batch, &sink, true, None).unwrap();

        assert_eq!(batch.result, Some(IngestStatus::Corrupt));
        assert!(tmp.path().join("a.wal").exists());
    }

    #[test]
    fn read_batch_respects_delete_on_ingest_flag() {
        let tmp = TempDir::new().unwrap();
        write_pair_file(tmp.path(), "a.wal", &[10]);

        let mut batch = WALBatch::new(Duration::ZERO, None);
        batch.add(tmp.path().join("a.wal"));

        let sink = RecordingSink::new(IngestStatus::Ok);
        let (batch, _) = read_batch(batch, &sink, false, None).unwrap();

        assert_eq!(batch.result, Some(IngestStatus::Ok));
        assert!(tmp.path().join("a.wal").exists());
    }

    #[test]
    fn read_batch_deletes_sub_header_files_without_ingesting() {
        let tmp = TempDir::new().unwrap();
        let stub = tmp.path().join("stub.wal");
        std::fs::write(&stub, [0u8; 10]).unwrap();

        let mut batch = WALBatch::new(Duration::ZERO, None);
        batch.add(&stub);

        let sink = RecordingSink::new(IngestStatus::Ok);
        let (batch, _) = read_batch(batch, &sink, true, None).unwrap();

        assert_eq!(batch.result, None);
        assert!(sink.seen.lock().unwrap().is_empty());
        assert!(!stub.exists());
    }

    #[test]
    fn read_batch_propagates_read_errors_and_deletes_nothing() {
        let tmp = TempDir::new().unwrap();
        write_pair_file(tmp.path(), "a.wal", &[10]);

        let mut batch = WALBatch::new(Duration::ZERO, None);
        batch.add(tmp.path().join("a.wal"));
        batch.add(tmp.path().join("missing.wal"));

        let sink = RecordingSink::new(IngestStatus::Ok);
        assert!(read_batch(batch, &sink, true, None).is_err());
        assert!(tmp.path().join("a.wal").exists());
    }

    #[test]
    fn read_batch_takes_and_reports_the_stream_lock() {
        let tmp = TempDir::new().unwrap();
        write_pair_file(tmp.path(), "a.wal", &[10]);

        let mut batch = WALBatch::new(Duration::ZERO, None);
        batch.add(tmp.path().join("a.wal"));

        let locks = StreamLocks::new();
        let sink = RecordingSink::new(IngestStatus::Ok);
        let (_, key) = read_batch(batch, &sink, true, Some(&locks)).unwrap();

        let key = key.expect("stream key reported");
        assert_eq!(key.measure, "HR");
        assert!(locks.is_held(&key));
    }
}
