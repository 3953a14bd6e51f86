//! End-to-end pipeline tests: producer pool → WAL directory → read manager
//! → storage engine
//!
//! These run the real components against temp directories with quiescence
//! windows scaled down to keep the suite fast.

use wavestore_core::{EngineConfig, ReadManagerConfig, SyncMode, WriterPoolConfig};
use wavestore_storage::engine::{EngineIngest, SqlIndex, TscEngine};
use wavestore_storage::pipeline::ReadManager;
use wavestore_storage::pool::{MessageKind, SensorMessage, WALFileManager};
use wavestore_storage::wal::Fingerprint;

use tempfile::TempDir;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = 1_700_000_000_000_000_000;
const NANOS: i64 = 1_000_000_000;

fn pool_config(dir: &Path) -> WriterPoolConfig {
    WriterPoolConfig {
        wal_dir: dir.to_path_buf(),
        file_length_time_s: 3600,
        idle_timeout_s: 600,
        gc_interval_s: 3600,
        flush_max_points: 5000,
        flush_max_seconds: 120,
        max_open_files: 64,
        sync_mode: SyncMode::Normal,
    }
}

fn metric(measure: &str, value: &str, t: i64) -> SensorMessage {
    SensorMessage {
        device_name: "bed-42".to_string(),
        measure_name: measure.to_string(),
        measure_units: "bpm".to_string(),
        freq_hz: 0.0,
        data_time_ns: t,
        server_time_ns: t + 100_000,
        data: value.to_string(),
        kind: MessageKind::Metric,
    }
}

fn waveform(t: i64, data: &str) -> SensorMessage {
    SensorMessage {
        device_name: "bed-42".to_string(),
        measure_name: "ECG_II".to_string(),
        measure_units: "mV".to_string(),
        freq_hz: 500.0,
        data_time_ns: t,
        server_time_ns: t + 100_000,
        data: data.to_string(),
        kind: MessageKind::Waveform {
            scale_m: 0.5,
            scale_b: 1.0,
        },
    }
}

fn wal_file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ==================== Fingerprint bucketing ====================

#[test]
fn same_bucket_messages_share_a_file_and_other_buckets_do_not() {
    let tmp = TempDir::new().unwrap();
    let mut manager = WALFileManager::new(pool_config(tmp.path())).unwrap();

    // Two messages inside one hour bucket, one in the next bucket.
    manager.write(&metric("HR", "60", T0)).unwrap();
    manager.write(&metric("HR", "61", T0 + 30 * NANOS)).unwrap();
    manager.write(&metric("HR", "62", T0 + 3601 * NANOS)).unwrap();
    manager.shutdown().unwrap();

    let names = wal_file_names(tmp.path());
    assert_eq!(names.len(), 2, "one file per bucket");

    let fp_a = Fingerprint::from_file_name(&names[0]).unwrap();
    let fp_b = Fingerprint::from_file_name(&names[1]).unwrap();
    assert_ne!(fp_a, fp_b, "bucket is part of the fingerprint");
}

// ==================== Full ingest path ====================

struct TestRig {
    wal_dir: TempDir,
    tsc_dir: TempDir,
    engine: Arc<TscEngine>,
    manager: ReadManager,
}

fn rig() -> TestRig {
    let _ = env_logger::builder().is_test(true).try_init();
    let wal_dir = TempDir::new().unwrap();
    let tsc_dir = TempDir::new().unwrap();

    let engine = Arc::new(
        TscEngine::new(
            EngineConfig {
                tsc_dir: tsc_dir.path().to_path_buf(),
                block_num_values: 256,
            },
            SqlIndex::open_in_memory().unwrap(),
        )
        .unwrap(),
    );
    let ingest = Arc::new(EngineIngest::new(Arc::clone(&engine)));
    let manager = ReadManager::new(
        ReadManagerConfig {
            wal_dir: wal_dir.path().to_path_buf(),
            wait_close_time_s: 0,
            max_workers: 4,
            wal_file_timeout_s: 60,
            delete_on_ingest: true,
        },
        ingest,
    )
    .unwrap();

    TestRig {
        wal_dir,
        tsc_dir,
        engine,
        manager,
    }
}

fn drive(rig: &mut TestRig, done: impl Fn(&ReadManager) -> bool) {
    for _ in 0..200 {
        rig.manager.loop_once().unwrap();
        if done(&rig.manager) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("pipeline did not settle");
}

#[test]
fn metrics_flow_from_producer_to_engine() {
    let mut rig = rig();

    {
        let mut pool = WALFileManager::new(pool_config(rig.wal_dir.path())).unwrap();
        for i in 0..20i64 {
            pool.write(&metric("HR", &format!("{}", 60 + i % 5), T0 + i * NANOS))
                .unwrap();
        }
        pool.shutdown().unwrap();
    }
    assert_eq!(wal_file_names(rig.wal_dir.path()).len(), 1);

    drive(&mut rig, |m| {
        m.num_open_batches() == 0
            && m.num_unfinished_batches() == 0
            && m.metrics().batches_ingested() == 1
    });

    // WAL sources deleted after success.
    assert!(wal_file_names(rig.wal_dir.path()).is_empty());

    let m = rig.engine.index().get_or_insert_measure("HR", 0, "bpm").unwrap();
    let d = rig.engine.index().get_or_insert_device("bed-42").unwrap();
    let (times, values) = rig.engine.read_data(m, d, 0, i64::MAX).unwrap();
    assert_eq!(times.len(), 20);
    assert_eq!(times[0], T0);
    assert_eq!(values[0], 60.0);

    // The engine produced at least one TSC file on disk.
    assert!(rig.tsc_dir.path().join(m.to_string()).join(d.to_string()).exists());
}

#[test]
fn waveforms_unscale_back_to_their_source_values() {
    let mut rig = rig();

    {
        let mut pool = WALFileManager::new(pool_config(rig.wal_dir.path())).unwrap();
        // Two contiguous 4-sample messages at 500 Hz: 8 ms apart.
        pool.write(&waveform(T0, "1.5^2.0^2.5^3.0")).unwrap();
        pool.write(&waveform(T0 + 8_000_000, "3.5^4.0^4.5^5.0")).unwrap();
        pool.shutdown().unwrap();
    }

    drive(&mut rig, |m| m.metrics().batches_ingested() == 1);

    let m = rig
        .engine
        .index()
        .get_or_insert_measure("ECG_II", 500_000_000_000, "mV")
        .unwrap();
    let d = rig.engine.index().get_or_insert_device("bed-42").unwrap();
    let (times, stored) = rig.engine.read_data(m, d, 0, i64::MAX).unwrap();

    assert_eq!(times.len(), 8);
    assert_eq!(times[0], T0);
    assert_eq!(times[4], T0 + 8_000_000);
    // Samples within a message follow the 2 ms cadence.
    assert_eq!(times[1], T0 + 2_000_000);

    // Values were stored as rescaled int16: (v - 1.0) / 0.5.
    let unscaled: Vec<f64> = stored.iter().map(|v| v * 0.5 + 1.0).collect();
    assert_eq!(unscaled, vec![1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0]);
}

#[test]
fn two_streams_ingest_independently() {
    let mut rig = rig();

    {
        let mut pool = WALFileManager::new(pool_config(rig.wal_dir.path())).unwrap();
        pool.write(&metric("HR", "60", T0)).unwrap();
        pool.write(&metric("RR", "18", T0)).unwrap();
        pool.shutdown().unwrap();
    }
    assert_eq!(wal_file_names(rig.wal_dir.path()).len(), 2);

    drive(&mut rig, |m| m.metrics().batches_ingested() == 2);
    assert!(wal_file_names(rig.wal_dir.path()).is_empty());
}

#[test]
fn duplicate_batches_are_deleted_without_rewriting() {
    let mut rig = rig();

    let write_once = |dir: &Path| {
        let mut pool = WALFileManager::new(pool_config(dir)).unwrap();
        pool.write(&metric("HR", "60", T0)).unwrap();
        pool.shutdown().unwrap();
    };

    write_once(rig.wal_dir.path());
    drive(&mut rig, |m| m.metrics().batches_ingested() == 1);

    // A restarted producer re-emits the same bucket: new file, same data.
    write_once(rig.wal_dir.path());
    drive(&mut rig, |m| m.metrics().duplicates() == 1);

    assert!(wal_file_names(rig.wal_dir.path()).is_empty());
    assert_eq!(rig.manager.metrics().batches_ingested(), 1);
    assert!(!rig.manager.is_shutdown());

    let m = rig.engine.index().get_or_insert_measure("HR", 0, "bpm").unwrap();
    let d = rig.engine.index().get_or_insert_device("bed-42").unwrap();
    let (times, _) = rig.engine.read_data(m, d, 0, i64::MAX).unwrap();
    assert_eq!(times.len(), 1);
}

#[test]
fn quiescence_window_delays_promotion() {
    let mut rig = rig();

    // Rebuild the manager with a 1-second window.
    let ingest = Arc::new(EngineIngest::new(Arc::clone(&rig.engine)));
    rig.manager = ReadManager::new(
        ReadManagerConfig {
            wal_dir: rig.wal_dir.path().to_path_buf(),
            wait_close_time_s: 1,
            max_workers: 2,
            wal_file_timeout_s: 60,
            delete_on_ingest: true,
        },
        ingest,
    )
    .unwrap();

    {
        let mut pool = WALFileManager::new(pool_config(rig.wal_dir.path())).unwrap();
        pool.write(&metric("HR", "60", T0)).unwrap();
        pool.shutdown().unwrap();
    }

    // Fresh files are grouped but not promoted.
    rig.manager.loop_once().unwrap();
    assert_eq!(rig.manager.num_open_batches(), 1);
    assert_eq!(rig.manager.num_unfinished_batches(), 0);

    std::thread::sleep(Duration::from_millis(1200));
    drive(&mut rig, |m| m.metrics().batches_ingested() == 1);
}
