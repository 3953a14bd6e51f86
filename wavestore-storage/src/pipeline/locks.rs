// 1. Local crate imports
use crate::wal::WALHeader;

// 2. External crate imports
use parking_lot::Mutex;

// 3. Standard library imports
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

/// Identity of one sensor stream
///
/// The same tuple the storage engine resolves measure and device IDs from,
/// so a lock taken here covers both ingestion and optimization of the
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub device: String,
    pub measure: String,
    pub freq_nhz: u64,
    pub units: String,
}

impl StreamKey {
    pub fn of_header(header: &WALHeader) -> Self {
        Self {
            device: header.device_name(),
            measure: header.measure_name(),
            freq_nhz: header.sample_freq,
            units: header.measure_units(),
        }
    }
}

/// Set of streams currently being worked on
///
/// Shared between the read manager's ingest workers and the optimizer so
/// that two workers never operate on the same stream at once. Holders
/// release explicitly; the read manager does so when it reaps a worker's
/// result.
#[derive(Debug, Default)]
pub struct StreamLocks {
    held: Mutex<HashSet<StreamKey>>,
}

impl StreamLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the lock for `key`; false if already held
    pub fn try_acquire(&self, key: &StreamKey) -> bool {
        self.held.lock().insert(key.clone())
    }

    /// Takes the lock for `key`, polling until the current holder releases
    pub fn acquire_blocking(&self, key: &StreamKey, poll: Duration) {
        while !self.try_acquire(key) {
            thread::sleep(poll);
        }
    }

    pub fn release(&self, key: &StreamKey) {
        self.held.lock().remove(key);
    }

    pub fn is_held(&self, key: &StreamKey) -> bool {
        self.held.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(measure: &str) -> StreamKey {
        StreamKey {
            device: "monitor-1".to_string(),
            measure: measure.to_string(),
            freq_nhz: 500_000_000_000,
            units: "mV".to_string(),
        }
    }

    #[test]
    fn acquire_is_exclusive_per_key() {
        let locks = StreamLocks::new();
        assert!(locks.try_acquire(&key("ECG_II")));
        assert!(!locks.try_acquire(&key("ECG_II")));
        assert!(locks.try_acquire(&key("ART")));

        locks.release(&key("ECG_II"));
        assert!(locks.try_acquire(&key("ECG_II")));
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        use std::sync::Arc;

        let locks = Arc::new(StreamLocks::new());
        locks.try_acquire(&key("ECG_II"));

        let contender = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.acquire_blocking(&key("ECG_II"), Duration::from_millis(10));
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());

        locks.release(&key("ECG_II"));
        contender.join().unwrap();
        assert!(locks.is_held(&key("ECG_II")));
    }
}
