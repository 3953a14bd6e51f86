//! TSC storage engine
//!
//! The downstream side of the pipeline: a metadata index (measure/device
//! resolution, file and block catalogs), a directory tree of compressed
//! block files, the write path that turns merged WAL payloads into blocks,
//! and the optimizer that rewrites small files into target-sized ones.

mod blocks;
mod index;
mod optimizer;
mod store;
mod write_path;

pub use blocks::{
    BlockValues, TimeData, TscBlock, TSC_BLOCK_HEADER_SIZE, TSC_BLOCK_VERSION,
    T_TYPE_GAP_ARRAY, T_TYPE_TIMESTAMP_ARRAY, V_TYPE_DOUBLE, V_TYPE_INT64,
};
pub use index::{BlockRow, NewBlock, SqlIndex};
pub use optimizer::{Optimizer, OptimizerReport};
pub use store::{condense_read_list, CondensedRead, StagedTscFile, TscFileStore};
pub use write_path::{create_gap_array, EngineIngest};

use wavestore_core::{EngineConfig, Error, Result};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

// period_ns = 10^18 / freq_nhz
const PERIOD_NS_NUMERATOR: i64 = 1_000_000_000_000_000_000;

/// The storage engine: index + file store + block writer
pub struct TscEngine {
    index: SqlIndex,
    store: TscFileStore,
    block_num_values: usize,
    time_profile: AtomicU8,
}

impl TscEngine {
    pub fn new(config: EngineConfig, index: SqlIndex) -> Result<Self> {
        Ok(Self {
            index,
            store: TscFileStore::new(&config.tsc_dir)?,
            block_num_values: config.block_num_values.max(1),
            time_profile: AtomicU8::new(0),
        })
    }

    pub fn index(&self) -> &SqlIndex {
        &self.index
    }

    pub fn store(&self) -> &TscFileStore {
        &self.store
    }

    /// Current block size in samples
    ///
    /// The time-compression profile widens blocks: timestamp-array streams
    /// pay 8 extra bytes per sample on the time axis, so a raised profile
    /// amortizes block overhead over more samples.
    pub fn effective_block_size(&self) -> usize {
        self.block_num_values << self.time_profile.load(Ordering::SeqCst)
    }

    /// Temporarily sets the time-compression profile
    ///
    /// The previous level is restored when the guard drops, so callers
    /// cannot leave the knob moved.
    pub fn raise_time_profile(&self, level: u8) -> ProfileGuard<'_> {
        let previous = self.time_profile.swap(level, Ordering::SeqCst);
        ProfileGuard {
            engine: self,
            previous,
        }
    }

    /// Whether a block already starts at this exact stream time
    pub fn has_block_at(&self, measure_id: i64, device_id: i64, start_time_n: i64) -> Result<bool> {
        self.index.block_exists(measure_id, device_id, start_time_n)
    }

    /// Writes one stream payload as a new TSC file of blocks
    ///
    /// Values are chunked into blocks of the current effective block size;
    /// each block carries its own slice of the time axis. One file row and
    /// its block rows are committed to the index in a single transaction.
    pub fn write_data(
        &self,
        measure_id: i64,
        device_id: i64,
        time_data: &TimeData,
        values: &BlockValues,
        freq_nhz: u64,
        start_time_n: i64,
        scale_b: f64,
        scale_m: f64,
    ) -> Result<()> {
        let num_values = values.len();
        if num_values == 0 {
            return Ok(());
        }
        if let TimeData::Timestamps(times) = time_data {
            if times.len() != num_values {
                return Err(Error::StorageEngine(format!(
                    "{} timestamps for {} values",
                    times.len(),
                    num_values
                )));
            }
        }

        let chunk = self.effective_block_size();
        let mut encoded = Vec::new();
        let mut new_blocks = Vec::new();

        let mut a = 0usize;
        while a < num_values {
            let b = (a + chunk).min(num_values);
            let (block_start, block_end, block_time) =
                slice_time(time_data, a, b, start_time_n, freq_nhz)?;
            let block_values = match values {
                BlockValues::Int64(v) => BlockValues::Int64(v[a..b].to_vec()),
                BlockValues::Float64(v) => BlockValues::Float64(v[a..b].to_vec()),
            };

            let block = TscBlock {
                start_time_n: block_start,
                end_time_n: block_end,
                scale_b,
                scale_m,
                time_data: block_time,
                values: block_values,
            };
            let bytes = block.encode()?;
            new_blocks.push(NewBlock {
                start_byte: encoded.len() as u64,
                num_bytes: bytes.len() as u64,
                start_time_n: block_start,
                end_time_n: block_end,
                num_values: (b - a) as u64,
            });
            encoded.extend(bytes);
            a = b;
        }

        let file_name = self.store.write_file(measure_id, device_id, &encoded)?;
        self.index
            .insert_file_with_blocks(&file_name, measure_id, device_id, &new_blocks)?;
        log::info!(
            "wrote {} blocks ({} bytes) for measure {measure_id} device {device_id}",
            new_blocks.len(),
            encoded.len()
        );
        Ok(())
    }

    /// Reads the given blocks' raw bytes as one condensed stream
    pub fn read_condensed_bytes(&self, blocks: &[BlockRow]) -> Result<Vec<u8>> {
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let mut file_ids: Vec<i64> = blocks.iter().map(|b| b.file_id).collect();
        file_ids.sort();
        file_ids.dedup();
        let paths = self.index.file_paths(&file_ids)?;

        let mut streams: HashMap<i64, (i64, i64)> = HashMap::new();
        for block in blocks {
            streams
                .entry(block.file_id)
                .or_insert((block.measure_id, block.device_id));
        }

        self.store.read_blocks(blocks, |file_id| {
            let name = paths
                .get(&file_id)
                .ok_or_else(|| Error::Index(format!("no file_index row for id {file_id}")))?;
            let (measure_id, device_id) = streams[&file_id];
            Ok(self.store.to_abs_path(name, measure_id, device_id))
        })
    }

    /// Decodes one stream's samples in `[start_time_n, end_time_n]`
    ///
    /// Times are reconstructed from each block's time axis; values are
    /// widened to f64. Mostly used by tests and the query layer above this
    /// crate.
    pub fn read_data(
        &self,
        measure_id: i64,
        device_id: i64,
        start_time_n: i64,
        end_time_n: i64,
    ) -> Result<(Vec<i64>, Vec<f64>)> {
        let rows = self
            .index
            .select_blocks(measure_id, device_id, start_time_n, end_time_n)?;
        let freq_nhz = self
            .index
            .measure_info(measure_id)?
            .map(|(_, freq, _)| freq)
            .unwrap_or(0);

        let mut times = Vec::new();
        let mut values = Vec::new();
        for row in &rows {
            let bytes = self.read_condensed_bytes(std::slice::from_ref(row))?;
            let (block, _) = TscBlock::decode(&bytes)?;
            let block_times = expand_block_times(&block, freq_nhz)?;
            let block_values: Vec<f64> = match &block.values {
                BlockValues::Int64(v) => v.iter().map(|x| *x as f64).collect(),
                BlockValues::Float64(v) => v.clone(),
            };
            for (t, v) in block_times.into_iter().zip(block_values) {
                if t >= start_time_n && t <= end_time_n {
                    times.push(t);
                    values.push(v);
                }
            }
        }
        Ok((times, values))
    }
}

/// Restores the engine's time-compression profile on drop
pub struct ProfileGuard<'a> {
    engine: &'a TscEngine,
    previous: u8,
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        self.engine
            .time_profile
            .store(self.previous, Ordering::SeqCst);
    }
}

/// Nominal duration of one sample in nanoseconds
fn sample_period_ns(freq_nhz: u64) -> Result<i64> {
    if freq_nhz == 0 {
        return Err(Error::StorageEngine(
            "gap-array time data requires a non-zero sample frequency".to_string(),
        ));
    }
    Ok(PERIOD_NS_NUMERATOR / freq_nhz as i64)
}

/// Extracts the time axis of samples `[a, b)` for one block
fn slice_time(
    time_data: &TimeData,
    a: usize,
    b: usize,
    start_time_n: i64,
    freq_nhz: u64,
) -> Result<(i64, i64, TimeData)> {
    match time_data {
        TimeData::Timestamps(times) => {
            Ok((times[a], times[b - 1], TimeData::Timestamps(times[a..b].to_vec())))
        }
        TimeData::GapArray(gaps) => {
            let period = sample_period_ns(freq_nhz)?;
            let time_at = |i: i64| -> i64 {
                let extra: i64 = gaps
                    .iter()
                    .filter(|(index, _)| *index <= i)
                    .map(|(_, duration)| duration)
                    .sum();
                start_time_n + i * period + extra
            };
            let block_start = time_at(a as i64);
            let block_end = time_at(b as i64 - 1);
            // A gap at the block's first sample is absorbed into its start
            // time; interior gaps are rebased to block-local indices.
            let rebased: Vec<(i64, i64)> = gaps
                .iter()
                .filter(|(index, _)| *index > a as i64 && (*index as usize) < b)
                .map(|(index, duration)| (index - a as i64, *duration))
                .collect();
            Ok((block_start, block_end, TimeData::GapArray(rebased)))
        }
    }
}

/// Reconstructs per-sample timestamps from a block's time axis
fn expand_block_times(block: &TscBlock, freq_nhz: u64) -> Result<Vec<i64>> {
    match &block.time_data {
        TimeData::Timestamps(times) => Ok(times.clone()),
        TimeData::GapArray(gaps) => {
            let period = sample_period_ns(freq_nhz)?;
            let n = block.num_values();
            let mut times = Vec::with_capacity(n);
            let mut extra = 0i64;
            let mut gap_iter = gaps.iter().peekable();
            for i in 0..n as i64 {
                while let Some((index, duration)) = gap_iter.peek() {
                    if *index <= i {
                        extra += duration;
                        gap_iter.next();
                    } else {
                        break;
                    }
                }
                times.push(block.start_time_n + i * period + extra);
            }
            Ok(times)
        }
    }
}
