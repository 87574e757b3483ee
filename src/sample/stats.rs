use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free drain counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for session-close reporting without contention.
#[derive(Debug, Default)]
pub struct DrainStats {
    entries_seen: AtomicU64,
    samples_decoded: AtomicU64,
    decode_errors: AtomicU64,
    entries_skipped: AtomicU64,
    lossy_drains: AtomicU64,
}

impl DrainStats {
    /// Create a new zeroed DrainStats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record entries visited by a drain, before decoding.
    pub fn record_seen(&self, n: u64) {
        self.entries_seen.fetch_add(n, Ordering::Relaxed);
    }

    /// Record successfully decoded samples.
    pub fn record_decoded(&self, n: u64) {
        self.samples_decoded.fetch_add(n, Ordering::Relaxed);
    }

    /// Record entries the decoder rejected.
    pub fn record_decode_errors(&self, n: u64) {
        self.decode_errors.fetch_add(n, Ordering::Relaxed);
    }

    /// Record leading entries skipped as already processed.
    pub fn record_skipped(&self, n: u64) {
        self.entries_skipped.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one drain that detected a lossy buffer wrap.
    pub fn record_lossy_drain(&self) {
        self.lossy_drains.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> DrainStatsSnapshot {
        DrainStatsSnapshot {
            entries_seen: self.entries_seen.swap(0, Ordering::Relaxed),
            samples_decoded: self.samples_decoded.swap(0, Ordering::Relaxed),
            decode_errors: self.decode_errors.swap(0, Ordering::Relaxed),
            entries_skipped: self.entries_skipped.swap(0, Ordering::Relaxed),
            lossy_drains: self.lossy_drains.swap(0, Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of drain counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStatsSnapshot {
    pub entries_seen: u64,
    pub samples_decoded: u64,
    pub decode_errors: u64,
    pub entries_skipped: u64,
    pub lossy_drains: u64,
}
