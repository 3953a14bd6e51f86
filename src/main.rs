//! Wavestore ingest service
//!
//! Wires the read manager, engine write path and optimizer together over
//! two directories (WAL in, TSC out) and runs the scan loop until a fatal
//! ingest outcome sets the shutdown flag. Producers are expected to write
//! WAL files into the directory through `pool::WALFileManager` from their
//! own process; this binary is the consume side.

use wavestore::engine::{EngineIngest, Optimizer, SqlIndex, TscEngine};
use wavestore::pipeline::ReadManager;
use wavestore::{EngineConfig, OptimizerConfig, ReadManagerConfig, Result};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the WAL directory is rescanned
const SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// How often the optimizer pass runs
const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        log::error!("wavestore exited with error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let wal_dir = args.next().unwrap_or_else(|| "wal".to_string());
    let tsc_dir = args.next().unwrap_or_else(|| "tsc".to_string());
    log::info!("wavestore starting: wal={wal_dir} tsc={tsc_dir}");
    std::fs::create_dir_all(&wal_dir)?;
    std::fs::create_dir_all(&tsc_dir)?;

    let engine_config = EngineConfig {
        tsc_dir: tsc_dir.clone().into(),
        ..EngineConfig::default()
    };
    let index = SqlIndex::open(std::path::Path::new(&tsc_dir).join("index.db"))?;
    let engine = Arc::new(TscEngine::new(engine_config, index)?);

    let manager_config = ReadManagerConfig {
        wal_dir: wal_dir.into(),
        ..ReadManagerConfig::default()
    };
    let ingest = Arc::new(EngineIngest::new(Arc::clone(&engine)));
    let mut manager = ReadManager::new(manager_config, ingest)?;

    let optimizer = Optimizer::new(Arc::clone(&engine), OptimizerConfig::default())
        .with_stream_locks(manager.stream_locks());

    let mut last_optimize = Instant::now();
    while !manager.is_shutdown() {
        manager.loop_once()?;

        if last_optimize.elapsed() >= OPTIMIZE_INTERVAL {
            let report = optimizer.run_once()?;
            log::info!(
                "optimizer pass: {} streams merged, {} files written, {} swept",
                report.streams_merged,
                report.files_written,
                report.unreferenced_removed
            );
            last_optimize = Instant::now();
        }

        std::thread::sleep(SCAN_INTERVAL);
    }

    log::error!("shutdown flag set, draining in-flight batches");
    manager.drain(Duration::from_millis(500));
    Ok(())
}
