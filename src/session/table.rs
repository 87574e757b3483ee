//! Hash-indexed histogram table.
//!
//! Samples aggregate by a composite key of the selected address-like
//! value, process, thread, and symbol-map version. Lookups and inserts
//! are O(1) amortized; ordering is imposed later by the report sorter.

use std::collections::{HashMap, TryReserveError};

use crate::sample::{Level, LEVEL_COUNT};

/// Composite histogram key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistKey {
    /// Selected value: instruction address, data address, or the raw
    /// latency/level value, depending on the view mode.
    pub value: u64,
    pub pid: u32,
    pub tid: u32,
    /// Symbol-map epoch; keeps pre- and post-exec samples apart.
    pub map_version: u32,
}

/// Counters for one histogram key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistEntry {
    /// Total samples observed for this key.
    pub total: u64,
    /// Per-level sub-counts. All zero when levels are not tracked.
    pub levels: [u64; LEVEL_COUNT],
}

/// The histogram table owned by one aggregation session.
#[derive(Debug)]
pub struct HistTable {
    entries: HashMap<HistKey, HistEntry>,
    track_levels: bool,
    total_samples: u64,
}

impl HistTable {
    /// Creates an empty table. `track_levels` is off for the level view,
    /// where the key value already is the level/latency.
    pub fn new(track_levels: bool) -> Self {
        Self {
            entries: HashMap::new(),
            track_levels,
            total_samples: 0,
        }
    }

    /// Pre-size for `additional` prospective keys, surfacing allocation
    /// failure instead of aborting. Existing contents are untouched on
    /// error.
    pub fn try_grow(&mut self, additional: usize) -> Result<(), TryReserveError> {
        self.entries.try_reserve(additional)
    }

    /// Record one classified sample. New keys start with zeroed
    /// counters before the increment.
    pub fn record(&mut self, key: HistKey, level: Level) {
        let entry = self.entries.entry(key).or_default();
        entry.total += 1;
        if self.track_levels {
            entry.levels[level.index()] += 1;
        }
        self.total_samples += 1;
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total samples recorded since the last reset.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Whether per-level sub-counts are being tracked.
    pub fn tracks_levels(&self) -> bool {
        self.track_levels
    }

    /// Materialize all entries into a flat list, in unspecified order.
    /// Allocation failure surfaces as an error with the table intact.
    pub fn snapshot(&self) -> Result<Vec<(HistKey, HistEntry)>, TryReserveError> {
        let mut rows = Vec::new();
        rows.try_reserve_exact(self.entries.len())?;
        rows.extend(self.entries.iter().map(|(k, v)| (*k, *v)));
        Ok(rows)
    }

    /// Drop all entries, e.g. when the symbol map epoch changes.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_samples = 0;
    }
}
