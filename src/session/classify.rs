//! Latency-to-level classification.
//!
//! In TLB sampling mode the hardware reports the servicing level
//! directly; in cache sampling mode the level is derived from the
//! observed miss latency against two platform thresholds obtained once
//! at session start.

use crate::sample::{Level, SamplingMode};

/// Latency thresholds in cycles separating the three cache levels.
///
/// A latency at or below `l2` was served by the L2, at or below `l3`
/// by the L3, and anything slower went to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelThresholds {
    pub l2: u32,
    pub l3: u32,
}

/// Platform cache description. Consulted exactly once, at session start.
pub trait CacheTopology {
    fn thresholds(&self) -> LevelThresholds;
}

/// Fixed thresholds from configuration or the PMU model table.
#[derive(Debug, Clone, Copy)]
pub struct StaticTopology(pub LevelThresholds);

impl CacheTopology for StaticTopology {
    fn thresholds(&self) -> LevelThresholds {
        self.0
    }
}

/// Map a sample's latency and hardware level indicator to a level.
///
/// Pure and deterministic for fixed thresholds.
pub fn classify(
    mode: SamplingMode,
    thresholds: LevelThresholds,
    latency: u32,
    hw_level: u8,
) -> Level {
    match mode {
        SamplingMode::Tlb => Level::from_index(hw_level as usize),
        SamplingMode::Cache => {
            if latency <= thresholds.l2 {
                Level::Near
            } else if latency <= thresholds.l3 {
                Level::Far
            } else {
                Level::Mem
            }
        }
    }
}
