//! WAL writer pool
//!
//! The pool multiplexes an unbounded stream of producer messages into a
//! bounded set of open WAL writers, keyed by the fingerprint of each
//! message's derived header. Entries are flushed by point-count or wall
//! time, closed after an idle window by a background GC, and LRU-evicted
//! when the pool hits its cap.
//!
//! A single mutex guards the map and all per-entry state; the per-message
//! critical section is one hash, one map lookup, one buffered append and a
//! counter update. Callers that need more parallelism shard by fingerprint
//! upstream.

mod message;

pub use message::{
    file_start_bucket, freq_hz_to_nhz, MessageKind, ParsedValues, SensorMessage,
};

use crate::metrics::PoolMetrics;
use crate::wal::{FileSuffix, Fingerprint, WALWriter};
use wavestore_core::{Result, WriterPoolConfig};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct PoolEntry {
    writer: WALWriter,
    file_name: String,
    last_access: Instant,
    unflushed_points: u64,
    next_flush_at: Instant,
}

struct PoolInner {
    config: WriterPoolConfig,
    pool: Mutex<HashMap<Fingerprint, PoolEntry>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn write(&self, msg: &SensorMessage) -> Result<()> {
        let (header, values) = msg.derive_header(self.config.file_length_time_s)?;
        let fingerprint = header.fingerprint();
        let points = values.point_count();

        let mut pool = self.pool.lock();

        if !pool.contains_key(&fingerprint) {
            if pool.len() >= self.config.max_open_files {
                self.evict_lru(&mut pool);
            }
            let (writer, file_name) = WALWriter::create_for_header(
                &self.config.wal_dir,
                &header,
                FileSuffix::Random,
                self.config.sync_mode,
            )?;
            log::info!("opened WAL file {file_name}");
            pool.insert(
                fingerprint,
                PoolEntry {
                    writer,
                    file_name,
                    last_access: Instant::now(),
                    unflushed_points: 0,
                    next_flush_at: Instant::now()
                        + Duration::from_secs(self.config.flush_max_seconds),
                },
            );
            self.metrics.record_file_opened();
        }

        let entry = pool
            .get_mut(&fingerprint)
            .expect("entry inserted above if absent");

        match &values {
            ParsedValues::Interval(array) => entry.writer.write_interval_message(
                msg.data_time_ns,
                msg.server_time_ns,
                array,
                None,
                0,
            )?,
            ParsedValues::Pair(value) => {
                entry
                    .writer
                    .write_time_value_pair(msg.data_time_ns, msg.server_time_ns, *value)?
            }
        }

        entry.unflushed_points += points;
        entry.last_access = Instant::now();
        self.metrics.record_points(points);

        if self.is_flushable(entry) {
            self.flush_entry(entry)?;
        }

        Ok(())
    }

    fn is_flushable(&self, entry: &PoolEntry) -> bool {
        entry.unflushed_points >= self.config.flush_max_points
            || (entry.next_flush_at <= Instant::now() && entry.unflushed_points > 0)
    }

    fn flush_entry(&self, entry: &mut PoolEntry) -> Result<()> {
        entry.writer.flush()?;
        entry.unflushed_points = 0;
        entry.next_flush_at = Instant::now() + Duration::from_secs(self.config.flush_max_seconds);
        self.metrics.record_flush();
        log::debug!("flushed WAL file {}", entry.file_name);
        Ok(())
    }

    /// Closes the least-recently-accessed entry to admit a new stream
    fn evict_lru(&self, pool: &mut HashMap<Fingerprint, PoolEntry>) {
        let Some(oldest) = pool
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| *key)
        else {
            return;
        };
        let mut entry = pool.remove(&oldest).expect("key taken from the map");
        log::info!("pool full, closing least-recently-used {}", entry.file_name);
        if let Err(e) = entry.writer.close() {
            log::error!("error closing {}: {e}", entry.file_name);
        }
        self.metrics.record_lru_eviction();
        self.metrics.record_file_closed();
    }

    fn gc(&self) {
        log::info!("running WAL pool GC");
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_s);
        let mut pool = self.pool.lock();
        let now = Instant::now();

        for entry in pool.values_mut() {
            if self.is_flushable(entry) {
                if let Err(e) = self.flush_entry(entry) {
                    log::error!("error flushing {}: {e}", entry.file_name);
                }
            }
        }

        let idle: Vec<Fingerprint> = pool
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) >= idle_timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in idle {
            let mut entry = pool.remove(&key).expect("key taken from the map");
            log::info!("closing idle WAL file {}", entry.file_name);
            if let Err(e) = entry.writer.close() {
                log::error!("error closing {}: {e}", entry.file_name);
            }
            self.metrics.record_idle_eviction();
            self.metrics.record_file_closed();
        }
    }

    fn close_all(&self) -> Result<()> {
        let mut pool = self.pool.lock();
        let mut first_error = None;
        for (_, mut entry) in pool.drain() {
            if let Err(e) = entry.writer.flush().and_then(|_| entry.writer.close()) {
                log::error!("error closing {}: {e}", entry.file_name);
                first_error.get_or_insert(e);
            }
            self.metrics.record_file_closed();
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Pool of open WAL writers keyed by stream fingerprint
///
/// The pool exclusively owns its writers; callers never hold a writer
/// handle, they hand messages to [`write`](WALFileManager::write) which
/// re-acquires the entry by fingerprint under the pool lock.
pub struct WALFileManager {
    inner: Arc<PoolInner>,
    gc_stop: Sender<()>,
    gc_thread: Option<JoinHandle<()>>,
}

impl WALFileManager {
    /// Creates the pool and starts its background GC thread
    pub fn new(config: WriterPoolConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.wal_dir)?;
        let gc_interval = Duration::from_secs(config.gc_interval_s);

        let inner = Arc::new(PoolInner {
            config,
            pool: Mutex::new(HashMap::new()),
            metrics: PoolMetrics::new(),
        });

        let (gc_stop, stop_rx) = bounded::<()>(1);
        let gc_inner = Arc::clone(&inner);
        let gc_thread = thread::Builder::new()
            .name("wal-pool-gc".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(gc_interval) {
                    Err(RecvTimeoutError::Timeout) => gc_inner.gc(),
                    _ => break,
                }
            })?;

        Ok(Self {
            inner,
            gc_stop,
            gc_thread: Some(gc_thread),
        })
    }

    /// Routes one message to its stream's writer, creating it on first use
    pub fn write(&self, msg: &SensorMessage) -> Result<()> {
        self.inner.write(msg)
    }

    /// Number of currently open writers
    pub fn open_files(&self) -> usize {
        self.inner.pool.lock().len()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Stops the GC thread and flush-closes every writer
    pub fn shutdown(&mut self) -> Result<()> {
        let _ = self.gc_stop.send(());
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
        self.inner.close_all()
    }
}

impl Drop for WALFileManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavestore_core::SyncMode;

    use tempfile::TempDir;

    fn config(dir: &std::path::Path) -> WriterPoolConfig {
        WriterPoolConfig {
            wal_dir: dir.to_path_buf(),
            file_length_time_s: 3600,
            idle_timeout_s: 600,
            gc_interval_s: 3600, // keep the background GC out of tests
            flush_max_points: 5000,
            flush_max_seconds: 120,
            max_open_files: 1024,
            sync_mode: SyncMode::Normal,
        }
    }

    fn metric_msg(measure: &str, value: &str, t: i64) -> SensorMessage {
        SensorMessage {
            device_name: "monitor-1".to_string(),
            measure_name: measure.to_string(),
            measure_units: "bpm".to_string(),
            freq_hz: 0.0,
            data_time_ns: t,
            server_time_ns: t + 100,
            data: value.to_string(),
            kind: MessageKind::Metric,
        }
    }

    fn wav_msg(measure: &str, t: i64) -> SensorMessage {
        SensorMessage {
            device_name: "monitor-1".to_string(),
            measure_name: measure.to_string(),
            measure_units: "mV".to_string(),
            freq_hz: 500.0,
            data_time_ns: t,
            server_time_ns: t + 100,
            data: "1.0^2.0^3.0^4.0".to_string(),
            kind: MessageKind::Waveform {
                scale_m: 0.5,
                scale_b: 1.0,
            },
        }
    }

    const T0: i64 = 1_700_000_000_000_000_000;

    #[test]
    fn messages_of_one_stream_share_one_file() {
        let tmp = TempDir::new().unwrap();
        let mut manager = WALFileManager::new(config(tmp.path())).unwrap();

        manager.write(&metric_msg("HR", "60", T0)).unwrap();
        manager.write(&metric_msg("HR", "61", T0 + 1_000_000_000)).unwrap();
        manager.write(&metric_msg("HR", "62", T0 + 2_000_000_000)).unwrap();

        assert_eq!(manager.open_files(), 1);
        assert_eq!(manager.metrics().files_created(), 1);
        assert_eq!(manager.metrics().points_written(), 3);

        manager.shutdown().unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn distinct_streams_get_distinct_files() {
        let tmp = TempDir::new().unwrap();
        let manager = WALFileManager::new(config(tmp.path())).unwrap();

        manager.write(&metric_msg("HR", "60", T0)).unwrap();
        manager.write(&metric_msg("RR", "18", T0)).unwrap();
        manager.write(&wav_msg("ECG_II", T0)).unwrap();

        assert_eq!(manager.open_files(), 3);
    }

    #[test]
    fn bucket_rollover_opens_a_new_file() {
        let tmp = TempDir::new().unwrap();
        let manager = WALFileManager::new(config(tmp.path())).unwrap();

        manager.write(&metric_msg("HR", "60", T0)).unwrap();
        manager
            .write(&metric_msg("HR", "61", T0 + 3600 * 1_000_000_000))
            .unwrap();

        assert_eq!(manager.open_files(), 2);
    }

    #[test]
    fn flush_policy_fires_on_point_count() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.flush_max_points = 4;
        let manager = WALFileManager::new(cfg).unwrap();

        // One waveform message carries 4 points and crosses the threshold.
        manager.write(&wav_msg("ECG_II", T0)).unwrap();
        assert_eq!(manager.metrics().flushes(), 1);
    }

    #[test]
    fn gc_closes_idle_writers() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.idle_timeout_s = 0; // everything is immediately idle
        let manager = WALFileManager::new(cfg).unwrap();

        manager.write(&metric_msg("HR", "60", T0)).unwrap();
        manager.write(&metric_msg("RR", "18", T0)).unwrap();
        assert_eq!(manager.open_files(), 2);

        manager.inner.gc();
        assert_eq!(manager.open_files(), 0);
        assert_eq!(manager.metrics().idle_evictions(), 2);

        // An evicted stream re-opens (a new file) on the next write.
        manager.write(&metric_msg("HR", "63", T0)).unwrap();
        assert_eq!(manager.open_files(), 1);
        assert_eq!(manager.metrics().files_created(), 3);
    }

    #[test]
    fn pool_cap_evicts_least_recently_used() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.max_open_files = 2;
        let manager = WALFileManager::new(cfg).unwrap();

        manager.write(&metric_msg("HR", "60", T0)).unwrap();
        manager.write(&metric_msg("RR", "18", T0)).unwrap();
        manager.write(&metric_msg("SpO2", "98", T0)).unwrap();

        assert_eq!(manager.open_files(), 2);
        assert_eq!(manager.metrics().lru_evictions(), 1);
    }

    #[test]
    fn shutdown_flushes_and_closes_everything() {
        let tmp = TempDir::new().unwrap();
        let mut manager = WALFileManager::new(config(tmp.path())).unwrap();

        manager.write(&metric_msg("HR", "60", T0)).unwrap();
        manager.write(&wav_msg("ECG_II", T0)).unwrap();
        manager.shutdown().unwrap();

        assert_eq!(manager.open_files(), 0);
        assert_eq!(manager.metrics().files_open(), 0);

        // Files on disk hold the flushed data.
        for entry in std::fs::read_dir(tmp.path()).unwrap() {
            let len = entry.unwrap().metadata().unwrap().len();
            assert!(len >= crate::wal::WAL_HEADER_SIZE as u64);
        }
    }
}
