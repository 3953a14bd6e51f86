//! Operational counters for the writer pool and the ingest pipeline
//!
//! All counters are atomics so the hot paths never take a lock for
//! accounting. Exporting them to a metrics backend is the embedding
//! service's concern; the pipeline only maintains the values.

use wavestore_core::IngestStatus;

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the WAL writer pool
#[derive(Debug, Default)]
pub struct PoolMetrics {
    files_open: AtomicU64,
    files_created: AtomicU64,
    flushes: AtomicU64,
    idle_evictions: AtomicU64,
    lru_evictions: AtomicU64,
    points_written: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file_opened(&self) {
        self.files_open.fetch_add(1, Ordering::Relaxed);
        self.files_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_closed(&self) {
        self.files_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_eviction(&self) {
        self.idle_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lru_eviction(&self) {
        self.lru_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_points(&self, count: u64) {
        self.points_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn files_open(&self) -> u64 {
        self.files_open.load(Ordering::Relaxed)
    }

    pub fn files_created(&self) -> u64 {
        self.files_created.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn idle_evictions(&self) -> u64 {
        self.idle_evictions.load(Ordering::Relaxed)
    }

    pub fn lru_evictions(&self) -> u64 {
        self.lru_evictions.load(Ordering::Relaxed)
    }

    pub fn points_written(&self) -> u64 {
        self.points_written.load(Ordering::Relaxed)
    }
}

/// Counters for batch ingestion outcomes
#[derive(Debug, Default)]
pub struct IngestMetrics {
    batches_ingested: AtomicU64,
    duplicates: AtomicU64,
    empty_batches: AtomicU64,
    corrupt_batches: AtomicU64,
    corrupt_trims: AtomicU64,
    errors: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an ingest callback outcome
    pub fn record_status(&self, status: IngestStatus) {
        let counter = match status {
            IngestStatus::Ok => &self.batches_ingested,
            IngestStatus::Duplicate => &self.duplicates,
            IngestStatus::Empty => &self.empty_batches,
            IngestStatus::Corrupt | IngestStatus::Fatal => &self.corrupt_batches,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a payload that was trimmed at a corrupt message but still
    /// ingested
    pub fn record_corrupt_trim(&self) {
        self.corrupt_trims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches_ingested(&self) -> u64 {
        self.batches_ingested.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn empty_batches(&self) -> u64 {
        self.empty_batches.load(Ordering::Relaxed)
    }

    pub fn corrupt_batches(&self) -> u64 {
        self.corrupt_batches.load(Ordering::Relaxed)
    }

    pub fn corrupt_trims(&self) -> u64 {
        self.corrupt_trims.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
