//! Write path from merged WAL payloads into the engine
//!
//! [`EngineIngest`] is the pipeline's ingest callback: it resolves measure
//! and device ids (inserting them on first sight), trims corrupt interval
//! messages, converts nominal times into the engine's time encoding (gap
//! array for fixed-rate streams, raw timestamps for aperiodic ones), widens
//! values, and writes one TSC file per batch. Its return status drives the
//! pipeline's delete/shutdown decisions.

use super::blocks::{BlockValues, TimeData};
use super::TscEngine;
use crate::metrics::IngestMetrics;
use crate::pipeline::IngestSink;
use crate::wal::WALPayload;
use wavestore_core::{IngestStatus, Result, ValueArray, ValueMode};

use std::sync::Arc;

/// Time-compression profile used while writing timestamp-array streams
const APERIODIC_TIME_PROFILE: u8 = 2;

/// Ingest callback writing merged payloads into a [`TscEngine`]
pub struct EngineIngest {
    engine: Arc<TscEngine>,
    metrics: Arc<IngestMetrics>,
}

impl EngineIngest {
    pub fn new(engine: Arc<TscEngine>) -> Self {
        Self {
            engine,
            metrics: Arc::new(IngestMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    fn try_ingest(&self, payload: &WALPayload) -> Result<IngestStatus> {
        if payload.num_messages() == 0 {
            return Ok(IngestStatus::Empty);
        }

        // Salvage the prefix before the first structurally corrupt message.
        let trimmed = trim_corrupt_messages(payload);
        let payload = match &trimmed {
            Some(clean) => {
                log::warn!(
                    "corrupt interval message in {}/{}: ingesting {} of {} messages",
                    payload.header.device_name(),
                    payload.header.measure_name(),
                    clean.num_messages(),
                    payload.num_messages()
                );
                self.metrics.record_corrupt_trim();
                clean
            }
            None => payload,
        };
        if payload.num_messages() == 0 {
            return Ok(IngestStatus::Corrupt);
        }

        let header = &payload.header;
        let measure_id = self.engine.index().get_or_insert_measure(
            &header.measure_name(),
            header.sample_freq,
            &header.measure_units(),
        )?;
        let device_id = self
            .engine
            .index()
            .get_or_insert_device(&header.device_name())?;

        let start_time_n = payload.nominal_times[0];
        if self.engine.has_block_at(measure_id, device_id, start_time_n)? {
            log::warn!(
                "duplicate data for measure {measure_id} device {device_id} at {start_time_n}"
            );
            return Ok(IngestStatus::Duplicate);
        }

        let values = effective_values(payload);
        if values.is_empty() {
            return Ok(IngestStatus::Empty);
        }
        let values = if header.input_value_type.is_integer() {
            BlockValues::Int64(values.to_i64()?)
        } else {
            BlockValues::Float64(values.to_f64())
        };

        // Aperiodic streams carry raw timestamps and a raised
        // time-compression profile, restored when the guard drops.
        let (time_data, _profile_guard) = if header.sample_freq == 0 {
            (
                TimeData::Timestamps(payload.nominal_times.clone()),
                Some(self.engine.raise_time_profile(APERIODIC_TIME_PROFILE)),
            )
        } else {
            let gaps = create_gap_array(
                &payload.nominal_times,
                payload.message_sizes.as_deref(),
                header.sample_freq,
            );
            (TimeData::GapArray(gaps), None)
        };

        self.engine.write_data(
            measure_id,
            device_id,
            &time_data,
            &values,
            header.sample_freq,
            start_time_n,
            header.scale_0,
            header.scale_1,
        )?;

        Ok(IngestStatus::Ok)
    }
}

impl IngestSink for EngineIngest {
    fn ingest(&self, payload: &WALPayload) -> IngestStatus {
        match self.try_ingest(payload) {
            Ok(status) => status,
            Err(e) => {
                log::error!("engine ingest failed: {e}");
                IngestStatus::Fatal
            }
        }
    }
}

/// Builds the gap array for a fixed-rate stream
///
/// Produces `(sample_index, extra_ns)` pairs at every message boundary
/// whose start time deviates from the nominal cadence implied by the
/// preceding samples. The pairs are cumulative-consistent: replaying
/// `start + index * period + Σ extra` reproduces each message's start time
/// exactly.
pub fn create_gap_array(
    nominal_times: &[i64],
    message_sizes: Option<&[u32]>,
    freq_nhz: u64,
) -> Vec<(i64, i64)> {
    // Per-sample period; message periods scale with each message's size.
    let period = (1_000_000_000_000_000_000i128 / freq_nhz as i128) as i64;
    let size_of = |i: usize| message_sizes.map_or(1, |sizes| sizes[i] as i64);

    let mut gaps = Vec::new();
    let mut sample_index: i64 = 0;
    let mut accumulated: i64 = 0;
    for i in 1..nominal_times.len() {
        sample_index += size_of(i - 1);
        let expected = nominal_times[0] + sample_index * period + accumulated;
        let extra = nominal_times[i] - expected;
        if extra != 0 {
            gaps.push((sample_index, extra));
            accumulated += extra;
        }
    }
    gaps
}

/// The samples actually carried by a payload
///
/// Fixed-stride interval records always occupy a full row of
/// `samples_per_message` values; a message with a smaller `num_values` pads
/// the tail, and the padding must not reach the engine.
fn effective_values(payload: &WALPayload) -> ValueArray {
    let header = &payload.header;
    if header.mode == ValueMode::Intervals && header.samples_per_message > 0 {
        let stride = header.samples_per_message as usize;
        let sizes = payload
            .message_sizes
            .as_ref()
            .expect("interval payloads carry message sizes");
        let ranges: Vec<std::ops::Range<usize>> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                let start = i * stride;
                start..start + (*size as usize).min(stride)
            })
            .collect();
        payload.values.extract(&ranges)
    } else {
        payload.values.clone()
    }
}

/// Truncates a fixed-stride interval payload at its first corrupt message
///
/// A message whose declared `num_values` or `null_offset` exceeds the
/// stride cannot be interpreted; everything before it is salvageable.
/// Returns `None` when the payload is clean.
fn trim_corrupt_messages(payload: &WALPayload) -> Option<WALPayload> {
    if payload.header.mode != ValueMode::Intervals || payload.header.samples_per_message == 0 {
        return None;
    }
    let stride = payload.header.samples_per_message;
    let sizes = payload.message_sizes.as_ref()?;
    let offsets = payload.null_offsets.as_ref()?;

    let first_corrupt = (0..payload.num_messages())
        .find(|&i| sizes[i] > stride || offsets[i] > stride)?;

    let mut clean = payload.clone();
    clean.nominal_times.truncate(first_corrupt);
    clean.server_times.truncate(first_corrupt);
    clean.values.truncate(first_corrupt * stride as usize);
    clean
        .message_sizes
        .as_mut()
        .expect("checked above")
        .truncate(first_corrupt);
    clean
        .null_offsets
        .as_mut()
        .expect("checked above")
        .truncate(first_corrupt);
    Some(clean)
}
