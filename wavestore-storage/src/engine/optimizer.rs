//! TSC file optimizer
//!
//! Ingestion writes one file per batch, so streams accumulate many small
//! files. The optimizer rewrites each stream's small files into
//! target-sized ones:
//!
//! 1. select the stream's blocks whose files are under `target_file_size`,
//!    time-ordered; stop unless at least two files are involved
//! 2. checksum the condensed byte stream of those blocks
//! 3. write the same bytes into new files of at least the target size,
//!    staged under temporary names
//! 4. in one index transaction: insert the new file and block rows, delete
//!    the old block rows; then move the staged files into place
//! 5. re-read the blocks through the new files and compare checksums
//!
//! Any failure after the transaction runs the undo path: reinsert the
//! original block rows, drop the new rows, unlink the new files. The
//! moved bytes are never the only copy until the checksum has passed, and
//! old files are only unlinked later by the unreferenced-files sweep.

use super::index::{BlockRow, NewBlock};
use super::store::StagedTscFile;
use super::TscEngine;
use crate::pipeline::{StreamKey, StreamLocks};
use wavestore_core::{Error, OptimizerConfig, Result};

use xxhash_rust::xxh3::xxh3_128;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one optimizer run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OptimizerReport {
    pub streams_considered: usize,
    pub streams_merged: usize,
    pub files_written: usize,
    pub unreferenced_removed: usize,
    pub errors: usize,
}

/// Merges small TSC files into target-sized ones, per stream
pub struct Optimizer {
    engine: Arc<TscEngine>,
    config: OptimizerConfig,
    locks: Option<Arc<StreamLocks>>,
}

impl Optimizer {
    pub fn new(engine: Arc<TscEngine>, config: OptimizerConfig) -> Self {
        Self {
            engine,
            config,
            locks: None,
        }
    }

    /// Shares the read manager's lock set so the optimizer never touches a
    /// stream that is mid-ingest
    pub fn with_stream_locks(mut self, locks: Arc<StreamLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// One full pass: merge every candidate stream, then sweep
    /// unreferenced files
    pub fn run_once(&self) -> Result<OptimizerReport> {
        let mut report = OptimizerReport::default();
        let budget = Duration::from_secs(self.config.optimization_timeout_s);

        let pairs = self
            .engine
            .index()
            .find_stream_pairs_with_small_files(self.config.target_file_size)?;

        for (measure_id, device_id) in pairs {
            report.streams_considered += 1;

            let key = self.stream_key(measure_id, device_id)?;
            if let (Some(locks), Some(key)) = (&self.locks, &key) {
                if !locks.try_acquire(key) {
                    log::info!(
                        "stream measure {measure_id} device {device_id} is busy, skipping"
                    );
                    continue;
                }
            }

            let started = Instant::now();
            let result = self.merge_stream(measure_id, device_id);
            if let (Some(locks), Some(key)) = (&self.locks, &key) {
                locks.release(key);
            }

            match result {
                Ok(Some(files_written)) => {
                    report.streams_merged += 1;
                    report.files_written += files_written;
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!(
                        "optimizing measure {measure_id} device {device_id} failed: {e}"
                    );
                    report.errors += 1;
                }
            }

            if started.elapsed() > budget {
                return Err(Error::Timeout(budget));
            }
        }

        report.unreferenced_removed = self.sweep_unreferenced()?;
        Ok(report)
    }

    fn stream_key(&self, measure_id: i64, device_id: i64) -> Result<Option<StreamKey>> {
        if self.locks.is_none() {
            return Ok(None);
        }
        let Some((measure, freq_nhz, units)) = self.engine.index().measure_info(measure_id)?
        else {
            return Ok(None);
        };
        let Some(device) = self.engine.index().device_tag(device_id)? else {
            return Ok(None);
        };
        Ok(Some(StreamKey {
            device,
            measure,
            freq_nhz,
            units,
        }))
    }

    /// Rewrites one stream's small files; `Ok(Some(n))` reports `n` new
    /// files, `Ok(None)` means there was nothing to merge
    fn merge_stream(&self, measure_id: i64, device_id: i64) -> Result<Option<usize>> {
        let target = self.config.target_file_size;
        let mut blocks = self
            .engine
            .index()
            .find_small_blocks(measure_id, device_id, target)?;

        if distinct_file_count(&blocks) < 2 {
            return Ok(None);
        }
        blocks.truncate(batch_limit(&blocks, target, self.config.max_blocks_per_run));
        if distinct_file_count(&blocks) < 2 {
            return Ok(None);
        }

        log::info!(
            "merging {} blocks across {} files for measure {measure_id} device {device_id}",
            blocks.len(),
            distinct_file_count(&blocks)
        );
        let checksum_before = xxh3_128(&self.engine.read_condensed_bytes(&blocks)?);

        // Phase 1: stage replacement files; no index changes yet, and a
        // failure here just drops the staging files.
        let mut staged: Vec<StagedTscFile> = Vec::new();
        let mut new_files: Vec<(String, Vec<NewBlock>)> = Vec::new();
        for (group_start, group_end) in partition_by_target(&blocks, target) {
            let group = &blocks[group_start..group_end];
            let bytes = self.engine.read_condensed_bytes(group)?;
            let staged_file =
                self.engine
                    .store()
                    .stage_file(measure_id, device_id, &bytes)?;

            let mut offset = 0u64;
            let rows: Vec<NewBlock> = group
                .iter()
                .map(|b| {
                    let row = NewBlock {
                        start_byte: offset,
                        num_bytes: b.num_bytes,
                        start_time_n: b.start_time_n,
                        end_time_n: b.end_time_n,
                        num_values: b.num_values,
                    };
                    offset += b.num_bytes;
                    row
                })
                .collect();
            new_files.push((staged_file.file_name().to_string(), rows));
            staged.push(staged_file);
        }

        let old_ids: Vec<i64> = blocks.iter().map(|b| b.id).collect();
        let file_names: Vec<String> = new_files.iter().map(|(name, _)| name.clone()).collect();

        // Phase 2: commit, promote, verify; undo everything on failure.
        match self.commit_and_verify(
            measure_id,
            device_id,
            &new_files,
            &old_ids,
            staged,
            checksum_before,
        ) {
            Ok(()) => {
                log::info!(
                    "rewrote measure {measure_id} device {device_id} into {} files",
                    file_names.len()
                );
                Ok(Some(file_names.len()))
            }
            Err(e) => {
                log::error!("merge failed, restoring original blocks: {e}");
                self.undo(measure_id, device_id, &file_names, &blocks);
                Err(e)
            }
        }
    }

    fn commit_and_verify(
        &self,
        measure_id: i64,
        device_id: i64,
        new_files: &[(String, Vec<NewBlock>)],
        old_ids: &[i64],
        staged: Vec<StagedTscFile>,
        checksum_before: u128,
    ) -> Result<()> {
        self.engine
            .index()
            .apply_optimization(measure_id, device_id, new_files, old_ids)?;
        for staged_file in staged {
            staged_file.promote()?;
        }

        let names: Vec<String> = new_files.iter().map(|(name, _)| name.clone()).collect();
        let new_rows = self.engine.index().select_blocks_by_file_paths(&names)?;
        let checksum_after = xxh3_128(&self.engine.read_condensed_bytes(&new_rows)?);

        if checksum_before != checksum_after {
            return Err(Error::ChecksumMismatch(format!(
                "content changed across rewrite: {checksum_before:032x} != {checksum_after:032x}"
            )));
        }
        Ok(())
    }

    /// Best-effort restoration of the pre-merge state
    ///
    /// Each step proceeds regardless of earlier failures so that as much
    /// as possible is restored.
    fn undo(
        &self,
        measure_id: i64,
        device_id: i64,
        new_file_names: &[String],
        original: &[BlockRow],
    ) {
        if let Err(e) = self.engine.index().reinsert_blocks(original) {
            log::error!("undo: reinserting original block rows failed: {e}");
        }
        if let Err(e) = self
            .engine
            .index()
            .delete_blocks_by_file_paths(new_file_names)
        {
            log::error!("undo: deleting new block rows failed: {e}");
        }
        for name in new_file_names {
            let path = self.engine.store().to_abs_path(name, measure_id, device_id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::error!("undo: unlinking {} failed: {e}", path.display()),
            }
        }
        if let Err(e) = self.engine.index().delete_files_by_paths(new_file_names) {
            log::error!("undo: deleting new file rows failed: {e}");
        }
    }

    /// Unlinks files with no referencing block rows and drops their index
    /// rows; runs after every merge pass
    fn sweep_unreferenced(&self) -> Result<usize> {
        let files = self.engine.index().find_unreferenced_files()?;
        if files.is_empty() {
            log::info!("no unreferenced TSC files to remove");
            return Ok(0);
        }

        let ids: Vec<i64> = files.iter().map(|(id, _)| *id).collect();
        self.engine.index().delete_file_rows(&ids)?;

        let names: HashSet<String> = files.into_iter().map(|(_, path)| path).collect();
        let removed = self.engine.store().remove_files_by_name(&names)?;
        log::info!("removed {removed} unreferenced TSC files");
        Ok(removed)
    }
}

/// Number of distinct files referenced by the blocks
fn distinct_file_count(blocks: &[BlockRow]) -> usize {
    let files: HashSet<i64> = blocks.iter().map(|b| b.file_id).collect();
    files.len()
}

/// How many leading blocks one run may rewrite
///
/// At least the prefix whose bytes first reach `target` (so the first
/// rewritten file is guaranteed at least target-sized and the optimizer
/// makes forward progress), and beyond that up to `max_blocks_per_run`.
fn batch_limit(blocks: &[BlockRow], target: u64, max_blocks_per_run: usize) -> usize {
    let mut cumulative = 0u64;
    let mut prefix = blocks.len();
    for (i, block) in blocks.iter().enumerate() {
        cumulative += block.num_bytes;
        if cumulative >= target {
            prefix = i + 1;
            break;
        }
    }
    prefix.max(max_blocks_per_run).min(blocks.len())
}

/// Splits blocks into consecutive groups whose bytes first reach `target`
///
/// Every group except possibly the last is at least target-sized.
fn partition_by_target(blocks: &[BlockRow], target: u64) -> Vec<(usize, usize)> {
    let mut groups = Vec::new();
    let mut start = 0usize;
    let mut cumulative = 0u64;
    for (i, block) in blocks.iter().enumerate() {
        cumulative += block.num_bytes;
        if cumulative >= target {
            groups.push((start, i + 1));
            start = i + 1;
            cumulative = 0;
        }
    }
    if start < blocks.len() {
        groups.push((start, blocks.len()));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BlockValues, SqlIndex, TimeData};
    use wavestore_core::EngineConfig;

    use tempfile::TempDir;

    fn test_engine(tmp: &TempDir, block_num_values: usize) -> Arc<TscEngine> {
        let config = EngineConfig {
            tsc_dir: tmp.path().to_path_buf(),
            block_num_values,
        };
        Arc::new(TscEngine::new(config, SqlIndex::open_in_memory().unwrap()).unwrap())
    }

    /// Writes `num_files` one-block files of consecutive metric samples
    fn seed_stream(engine: &TscEngine, num_files: usize, samples_per_file: usize) -> (i64, i64) {
        let m = engine.index().get_or_insert_measure("HR", 0, "bpm").unwrap();
        let d = engine.index().get_or_insert_device("monitor-1").unwrap();
        for file in 0..num_files {
            let base = (file * samples_per_file) as i64;
            let times: Vec<i64> = (0..samples_per_file as i64)
                .map(|i| (base + i) * 1_000_000)
                .collect();
            let values = BlockValues::Int64((0..samples_per_file as i64).map(|i| base + i).collect());
            engine
                .write_data(m, d, &TimeData::Timestamps(times), &values, 0, base, 0.0, 0.0)
                .unwrap();
        }
        (m, d)
    }

    fn file_row(file_id: i64, num_bytes: u64, start: i64) -> BlockRow {
        BlockRow {
            id: 0,
            measure_id: 1,
            device_id: 1,
            file_id,
            start_byte: 0,
            num_bytes,
            start_time_n: start,
            end_time_n: start + 9,
            num_values: 10,
        }
    }

    #[test]
    fn batch_limit_covers_the_target_and_honors_the_cap() {
        let blocks: Vec<BlockRow> = (0..10).map(|i| file_row(i, 100, i * 10)).collect();

        // Cap larger than the target prefix: cap wins.
        assert_eq!(batch_limit(&blocks, 250, 8), 8);
        // Target prefix larger than the cap: target wins.
        assert_eq!(batch_limit(&blocks, 950, 2), 10);
        // Never beyond the block list.
        assert_eq!(batch_limit(&blocks, 10_000, 100), 10);
    }

    #[test]
    fn partition_makes_target_sized_groups_with_a_tail() {
        let blocks: Vec<BlockRow> = (0..7).map(|i| file_row(i, 100, i * 10)).collect();
        assert_eq!(partition_by_target(&blocks, 300), vec![(0, 3), (3, 6), (6, 7)]);
        assert_eq!(partition_by_target(&blocks, 1000), vec![(0, 7)]);
    }

    #[test]
    fn merge_combines_small_files_and_preserves_data() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, 100);
        let (m, d) = seed_stream(&engine, 10, 100);
        assert_eq!(engine.index().count_stream_files(m, d).unwrap(), 10);

        let (times_before, values_before) = engine.read_data(m, d, 0, i64::MAX).unwrap();

        // Each file is a few hundred bytes; target eight-ish of them.
        let file_size = engine
            .index()
            .find_small_blocks(m, d, u64::MAX)
            .unwrap()[0]
            .num_bytes;
        let config = OptimizerConfig {
            target_file_size: file_size * 8,
            max_blocks_per_run: 10_000,
            optimization_timeout_s: 3600,
        };
        let optimizer = Optimizer::new(Arc::clone(&engine), config.clone());
        let report = optimizer.run_once().unwrap();

        assert_eq!(report.streams_merged, 1);
        assert_eq!(report.errors, 0);
        // The ten originals are swept once their blocks move.
        assert_eq!(report.unreferenced_removed, 10);
        assert!(engine.index().count_stream_files(m, d).unwrap() <= 2);

        // Byte-identical data after the rewrite.
        let (times_after, values_after) = engine.read_data(m, d, 0, i64::MAX).unwrap();
        assert_eq!(times_before, times_after);
        assert_eq!(values_before, values_after);

        // Rewritten files meet the target (except possibly the tail).
        let remaining = engine.index().find_small_blocks(m, d, u64::MAX).unwrap();
        let mut per_file: std::collections::HashMap<i64, u64> = std::collections::HashMap::new();
        for block in &remaining {
            *per_file.entry(block.file_id).or_default() += block.num_bytes;
        }
        let mut sizes: Vec<u64> = per_file.values().copied().collect();
        sizes.sort();
        for size in &sizes[1..] {
            assert!(*size >= config.target_file_size);
        }
    }

    #[test]
    fn optimizer_is_idempotent_once_files_meet_the_target() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, 100);
        let (_, _) = seed_stream(&engine, 6, 100);

        let file_size = engine
            .index()
            .find_small_blocks(1, 1, u64::MAX)
            .unwrap()[0]
            .num_bytes;
        let config = OptimizerConfig {
            target_file_size: file_size * 3,
            max_blocks_per_run: 10_000,
            optimization_timeout_s: 3600,
        };
        let optimizer = Optimizer::new(Arc::clone(&engine), config);

        let first = optimizer.run_once().unwrap();
        assert_eq!(first.streams_merged, 1);

        let second = optimizer.run_once().unwrap();
        assert_eq!(second.streams_merged, 0);
        assert_eq!(second.files_written, 0);
        assert_eq!(second.unreferenced_removed, 0);
    }

    #[test]
    fn single_file_streams_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, 100);
        seed_stream(&engine, 1, 50);

        let optimizer = Optimizer::new(
            Arc::clone(&engine),
            OptimizerConfig {
                target_file_size: 1_000_000,
                ..OptimizerConfig::default()
            },
        );
        let report = optimizer.run_once().unwrap();
        assert_eq!(report.streams_considered, 0);
        assert_eq!(report.streams_merged, 0);
    }

    #[test]
    fn failed_merge_leaves_the_index_unchanged() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, 100);
        let (m, d) = seed_stream(&engine, 3, 50);

        let before = engine.index().find_small_blocks(m, d, u64::MAX).unwrap();

        // Break one source file on disk: phase 1 reads fail before any
        // index mutation.
        let victim = &before[0];
        let paths = engine.index().file_paths(&[victim.file_id]).unwrap();
        let abs = engine
            .store()
            .to_abs_path(&paths[&victim.file_id], m, d);
        std::fs::remove_file(&abs).unwrap();

        let optimizer = Optimizer::new(
            Arc::clone(&engine),
            OptimizerConfig {
                target_file_size: 1_000_000,
                ..OptimizerConfig::default()
            },
        );
        let report = optimizer.run_once().unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.streams_merged, 0);

        let after = engine.index().find_small_blocks(m, d, u64::MAX).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn busy_streams_are_skipped_under_shared_locks() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp, 100);
        let (m, d) = seed_stream(&engine, 3, 50);

        let locks = Arc::new(StreamLocks::new());
        let (measure, freq_nhz, units) = engine.index().measure_info(m).unwrap().unwrap();
        let key = StreamKey {
            device: engine.index().device_tag(d).unwrap().unwrap(),
            measure,
            freq_nhz,
            units,
        };
        locks.try_acquire(&key);

        let optimizer = Optimizer::new(
            Arc::clone(&engine),
            OptimizerConfig {
                target_file_size: 1_000_000,
                ..OptimizerConfig::default()
            },
        )
        .with_stream_locks(Arc::clone(&locks));

        let report = optimizer.run_once().unwrap();
        assert_eq!(report.streams_merged, 0);
        assert_eq!(engine.index().count_stream_files(m, d).unwrap(), 3);

        // Still held by the "worker"; the optimizer must not release it.
        assert!(locks.is_held(&key));
    }
}
