//! Batch read manager
//!
//! The manager owns the WAL directory scan loop: it groups files into open
//! batches by the fingerprint in their filename, promotes quiescent batches
//! to the worker pool, and reaps finished workers. The `open_batches` and
//! `closed_batches` key sets are disjoint at every observable point (a
//! fingerprint is either accumulating files or in flight, never both), which
//! is what prevents a stream's new files from joining a batch that is
//! already being ingested.

use super::locks::{StreamKey, StreamLocks};
use super::read_process::{read_batch, IngestSink};
use super::workers::{TaskHandle, WorkerPool};
use crate::metrics::IngestMetrics;
use crate::wal::{Fingerprint, WALBatch};
use wavestore_core::{IngestStatus, ReadManagerConfig, Result};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

type BatchHandle = TaskHandle<(WALBatch, Option<StreamKey>)>;

/// Scans a WAL directory and drives batches through the read pipeline
pub struct ReadManager {
    config: ReadManagerConfig,
    ingest: Arc<dyn IngestSink>,
    workers: WorkerPool,
    open_batches: HashMap<Fingerprint, WALBatch>,
    closed_batches: HashMap<Fingerprint, BatchHandle>,
    locks: Arc<StreamLocks>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<IngestMetrics>,
}

impl ReadManager {
    pub fn new(config: ReadManagerConfig, ingest: Arc<dyn IngestSink>) -> Result<Self> {
        let workers = WorkerPool::new(config.max_workers)?;
        Ok(Self {
            config,
            ingest,
            workers,
            open_batches: HashMap::new(),
            closed_batches: HashMap::new(),
            locks: Arc::new(StreamLocks::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(IngestMetrics::new()),
        })
    }

    /// Shared lock set, for wiring the optimizer to the same streams
    pub fn stream_locks(&self) -> Arc<StreamLocks> {
        Arc::clone(&self.locks)
    }

    /// Shared shutdown flag; set by fatal ingest outcomes and timeouts
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn num_open_batches(&self) -> usize {
        self.open_batches.len()
    }

    /// Batches currently in flight on the worker pool
    pub fn num_unfinished_batches(&self) -> usize {
        self.closed_batches.len()
    }

    /// One scheduling tick: scan, group, promote, reap
    pub fn loop_once(&mut self) -> Result<()> {
        let paths = self.scan_paths()?;
        self.update_batches(paths);
        if !self.is_shutdown() {
            self.promote_ready();
        }
        self.reap_finished();
        Ok(())
    }

    /// Runs ticks until the shutdown flag is set, then drains in-flight work
    pub fn run(&mut self, poll: Duration) -> Result<()> {
        while !self.is_shutdown() {
            self.loop_once()?;
            std::thread::sleep(poll);
        }
        self.drain(poll);
        Ok(())
    }

    /// Waits for in-flight workers to finish or time out
    pub fn drain(&mut self, poll: Duration) {
        while !self.closed_batches.is_empty() {
            self.reap_finished();
            std::thread::sleep(poll);
        }
    }

    /// Enumerates `*.wal` files sorted by ascending mtime
    fn scan_paths(&self) -> Result<Vec<PathBuf>> {
        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.config.wal_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            // A worker may unlink files mid-scan; skip what disappeared.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime = metadata.modified()?;
            found.push((mtime, path));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Assigns each path to its open batch, skipping in-flight fingerprints
    fn update_batches(&mut self, paths: Vec<PathBuf>) {
        let wait = Duration::from_secs(self.config.wait_close_time_s);
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(fingerprint) = Fingerprint::from_file_name(name) else {
                log::warn!("ignoring foreign file in WAL directory: {name}");
                continue;
            };
            if self.closed_batches.contains_key(&fingerprint) {
                // This stream is being processed; its new files wait for
                // the next scan after the worker is reaped.
                continue;
            }
            self.open_batches
                .entry(fingerprint)
                .or_insert_with(|| WALBatch::new(wait, Some(fingerprint)))
                .add(path);
        }
    }

    /// Moves every ready batch onto the worker pool
    fn promote_ready(&mut self) {
        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for (fingerprint, batch) in &self.open_batches {
            match batch.is_ready() {
                Ok(true) => ready.push(*fingerprint),
                Ok(false) => {}
                Err(e) => {
                    log::error!("dropping batch {fingerprint}: {e}");
                    failed.push(*fingerprint);
                }
            }
        }

        for fingerprint in failed {
            self.open_batches.remove(&fingerprint);
            self.metrics.record_error();
        }

        for fingerprint in ready {
            let batch = self
                .open_batches
                .remove(&fingerprint)
                .expect("key collected from the map");
            let ingest = Arc::clone(&self.ingest);
            let locks = Arc::clone(&self.locks);
            let delete_on_ingest = self.config.delete_on_ingest;

            log::info!("promoting batch {fingerprint} ({} files)", batch.len());
            let handle = self.workers.submit(move || {
                read_batch(batch, ingest.as_ref(), delete_on_ingest, Some(locks.as_ref()))
            });
            self.closed_batches.insert(fingerprint, handle);
        }
    }

    /// Collects finished workers, surfacing their outcomes
    fn reap_finished(&mut self) {
        let timeout = Duration::from_secs(self.config.wal_file_timeout_s);
        let fingerprints: Vec<Fingerprint> = self.closed_batches.keys().copied().collect();

        for fingerprint in fingerprints {
            let handle = self
                .closed_batches
                .get_mut(&fingerprint)
                .expect("key collected from the map");

            match handle.try_take() {
                Some(Ok((batch, stream_key))) => {
                    if let Some(key) = stream_key {
                        self.locks.release(&key);
                    }
                    if let Some(status) = batch.result {
                        self.metrics.record_status(status);
                        if status == IngestStatus::Fatal {
                            log::error!("fatal ingest result for batch {fingerprint}");
                            self.shutdown.store(true, Ordering::SeqCst);
                        }
                    }
                    self.closed_batches.remove(&fingerprint);
                }
                Some(Err(e)) => {
                    log::error!("batch {fingerprint} failed: {e}");
                    self.metrics.record_error();
                    self.closed_batches.remove(&fingerprint);
                }
                None => {
                    if handle.elapsed() > timeout {
                        log::error!(
                            "batch {fingerprint} exceeded its {timeout:?} budget, shutting down"
                        );
                        self.metrics.record_error();
                        self.shutdown.store(true, Ordering::SeqCst);
                        self.closed_batches.remove(&fingerprint);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{FileSuffix, WALHeader, WALPayload, WALWriter, WAL_CURRENT_VERSION};
    use wavestore_core::{ScaleType, SyncMode, Value, ValueMode, ValueType};

    use tempfile::TempDir;

    use std::sync::Mutex;

    fn stream_header(measure: &str) -> WALHeader {
        WALHeader {
            version: WAL_CURRENT_VERSION,
            device_name: WALHeader::pack_name("monitor-5").unwrap(),
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
            measure_name: WALHeader::pack_name(measure).unwrap(),
            measure_units: WALHeader::pack_name("bpm").unwrap(),
        }
    }

    fn write_stream_file(dir: &std::path::Path, measure: &str, suffix: u64, times: &[i64]) {
        let (mut writer, _) = WALWriter::create_for_header(
            dir,
            &stream_header(measure),
            FileSuffix::Number(suffix),
            SyncMode::Normal,
        )
        .unwrap();
        for t in times {
            writer
                .write_time_value_pair(*t, t + 1, Value::Float64(*t as f64))
                .unwrap();
        }
        writer.close().unwrap();
    }

    struct CountingSink {
        status: IngestStatus,
        payloads: Mutex<Vec<WALPayload>>,
    }

    impl CountingSink {
        fn new(status: IngestStatus) -> Arc<Self> {
            Arc::new(Self {
                status,
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    impl IngestSink for CountingSink {
        fn ingest(&self, payload: &WALPayload) -> IngestStatus {
            self.payloads.lock().unwrap().push(payload.clone());
            self.status
        }
    }

    fn config(dir: &std::path::Path) -> ReadManagerConfig {
        ReadManagerConfig {
            wal_dir: dir.to_path_buf(),
            wait_close_time_s: 0,
            max_workers: 2,
            wal_file_timeout_s: 60,
            delete_on_ingest: true,
        }
    }

    fn tick_until<F: Fn(&ReadManager) -> bool>(manager: &mut ReadManager, done: F) {
        for _ in 0..100 {
            manager.loop_once().unwrap();
            assert_disjoint(manager);
            if done(manager) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("manager did not reach the expected state");
    }

    fn assert_disjoint(manager: &ReadManager) {
        for fingerprint in manager.open_batches.keys() {
            assert!(
                !manager.closed_batches.contains_key(fingerprint),
                "open and closed batch keys overlap"
            );
        }
    }

    #[test]
    fn files_of_one_stream_merge_into_one_ingest_call() {
        let tmp = TempDir::new().unwrap();
        write_stream_file(tmp.path(), "HR", 1, &[10, 20]);
        write_stream_file(tmp.path(), "HR", 2, &[30]);

        let sink = CountingSink::new(IngestStatus::Ok);
        let mut manager = ReadManager::new(config(tmp.path()), sink.clone()).unwrap();

        tick_until(&mut manager, |m| {
            m.num_open_batches() == 0 && m.num_unfinished_batches() == 0 && sink.count() > 0
        });

        assert_eq!(sink.count(), 1);
        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads[0].nominal_times, vec![10, 20, 30]);
        assert_eq!(manager.metrics().batches_ingested(), 1);

        // Sources are gone after a successful ingest.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        // The worker's stream lock was released on reap.
        assert!(manager.stream_locks().is_empty());
    }

    #[test]
    fn distinct_streams_become_distinct_batches() {
        let tmp = TempDir::new().unwrap();
        write_stream_file(tmp.path(), "HR", 1, &[10]);
        write_stream_file(tmp.path(), "RR", 1, &[10]);

        let sink = CountingSink::new(IngestStatus::Ok);
        let mut manager = ReadManager::new(config(tmp.path()), sink.clone()).unwrap();

        tick_until(&mut manager, |m| {
            m.num_unfinished_batches() == 0 && sink.count() == 2
        });
    }

    #[test]
    fn unready_batches_are_not_promoted() {
        let tmp = TempDir::new().unwrap();
        write_stream_file(tmp.path(), "HR", 1, &[10]);

        let mut cfg = config(tmp.path());
        cfg.wait_close_time_s = 3600; // nothing quiesces during the test
        let sink = CountingSink::new(IngestStatus::Ok);
        let mut manager = ReadManager::new(cfg, sink.clone()).unwrap();

        manager.loop_once().unwrap();
        assert_eq!(manager.num_open_batches(), 1);
        assert_eq!(manager.num_unfinished_batches(), 0);
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn foreign_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(tmp.path().join("odd-name.wal"), b"junk").unwrap();

        let sink = CountingSink::new(IngestStatus::Ok);
        let mut manager = ReadManager::new(config(tmp.path()), sink.clone()).unwrap();

        manager.loop_once().unwrap();
        assert_eq!(manager.num_open_batches(), 0);
        assert_eq!(manager.num_unfinished_batches(), 0);
    }

    #[test]
    fn corrupt_status_keeps_files_for_inspection() {
        let tmp = TempDir::new().unwrap();
        write_stream_file(tmp.path(), "HR", 1, &[10]);

        let sink = CountingSink::new(IngestStatus::Corrupt);
        let mut manager = ReadManager::new(config(tmp.path()), sink.clone()).unwrap();

        tick_until(&mut manager, |m| {
            m.num_unfinished_batches() == 0 && sink.count() > 0
        });

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
        assert_eq!(manager.metrics().corrupt_batches(), 1);
    }

    #[test]
    fn fatal_status_sets_shutdown_and_stops_scheduling() {
        let tmp = TempDir::new().unwrap();
        write_stream_file(tmp.path(), "HR", 1, &[10]);

        let sink = CountingSink::new(IngestStatus::Fatal);
        let mut manager = ReadManager::new(config(tmp.path()), sink.clone()).unwrap();

        tick_until(&mut manager, |m| m.is_shutdown());

        // New files are still grouped but never promoted once shut down.
        write_stream_file(tmp.path(), "RR", 1, &[10]);
        manager.loop_once().unwrap();
        manager.loop_once().unwrap();
        assert_eq!(manager.num_unfinished_batches(), 0);
        assert_eq!(sink.count(), 1);
    }
}
