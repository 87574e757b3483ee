use std::fmt;

use super::decode::{Itanium2Decoder, ItaniumDecoder, MontecitoDecoder, PmuDecoder};
use super::SamplingMode;
use crate::session::classify::LevelThresholds;

/// PMU model families with event-address sampling support.
///
/// Each model carries its own payload decoder, its event name table,
/// and the default latency thresholds of its cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuModel {
    Itanium,
    Itanium2,
    Montecito,
}

impl PmuModel {
    /// Returns the canonical config/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Itanium => "itanium",
            Self::Itanium2 => "itanium2",
            Self::Montecito => "montecito",
        }
    }

    /// Convert from the canonical config label name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "itanium" => Some(Self::Itanium),
            "itanium2" => Some(Self::Itanium2),
            "montecito" => Some(Self::Montecito),
            _ => None,
        }
    }

    /// Return all known models.
    pub fn all() -> &'static [Self] {
        &[Self::Itanium, Self::Itanium2, Self::Montecito]
    }

    /// Classify a configured event name into the address-sampling mode
    /// it drives, or `None` for plain counting events.
    pub fn classify_event(self, name: &str) -> Option<SamplingMode> {
        match self {
            // The first generation has exactly one event per EAR flavor.
            Self::Itanium => match name {
                "data_ear_cache" => Some(SamplingMode::Cache),
                "data_ear_tlb" => Some(SamplingMode::Tlb),
                _ => None,
            },
            // Later generations qualify the cache EAR event with a
            // minimum-latency filter (data_ear_cache_lat4, _lat8, ...).
            Self::Itanium2 | Self::Montecito => {
                if name.starts_with("data_ear_tlb") {
                    Some(SamplingMode::Tlb)
                } else if name.starts_with("data_ear_cache") {
                    Some(SamplingMode::Cache)
                } else {
                    None
                }
            }
        }
    }

    /// Whether `name` is a known plain counting event for this model.
    pub fn is_counting_event(self, name: &str) -> bool {
        matches!(
            name,
            "cpu_cycles" | "inst_retired" | "l2_misses" | "l3_misses" | "dtlb_misses"
        )
    }

    /// Build the payload decoder for this model.
    pub fn decoder(self) -> Box<dyn PmuDecoder> {
        match self {
            Self::Itanium => Box::new(ItaniumDecoder),
            Self::Itanium2 => Box::new(Itanium2Decoder),
            Self::Montecito => Box::new(MontecitoDecoder),
        }
    }

    /// Default cache latency thresholds (cycles) separating the three
    /// levels, used when the configuration does not override them.
    pub const fn default_thresholds(self) -> LevelThresholds {
        match self {
            Self::Itanium => LevelThresholds { l2: 6, l3: 21 },
            Self::Itanium2 => LevelThresholds { l2: 5, l3: 14 },
            Self::Montecito => LevelThresholds { l2: 5, l3: 16 },
        }
    }
}

impl fmt::Display for PmuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_roundtrip() {
        for model in PmuModel::all() {
            assert_eq!(PmuModel::from_name(model.as_str()), Some(*model));
        }
        assert!(PmuModel::from_name("pentium").is_none());
    }

    #[test]
    fn test_classify_event_itanium_exact_names() {
        let m = PmuModel::Itanium;
        assert_eq!(m.classify_event("data_ear_cache"), Some(SamplingMode::Cache));
        assert_eq!(m.classify_event("data_ear_tlb"), Some(SamplingMode::Tlb));
        // Latency-qualified names belong to later generations.
        assert_eq!(m.classify_event("data_ear_cache_lat4"), None);
        assert_eq!(m.classify_event("cpu_cycles"), None);
    }

    #[test]
    fn test_classify_event_itanium2_prefixes() {
        let m = PmuModel::Itanium2;
        assert_eq!(
            m.classify_event("data_ear_cache_lat4"),
            Some(SamplingMode::Cache)
        );
        assert_eq!(
            m.classify_event("data_ear_cache_lat1024"),
            Some(SamplingMode::Cache)
        );
        assert_eq!(m.classify_event("data_ear_tlb_all"), Some(SamplingMode::Tlb));
        assert_eq!(m.classify_event("inst_retired"), None);
    }

    #[test]
    fn test_counting_events() {
        assert!(PmuModel::Itanium2.is_counting_event("cpu_cycles"));
        assert!(!PmuModel::Itanium2.is_counting_event("data_ear_cache_lat4"));
        assert!(!PmuModel::Itanium2.is_counting_event("not_an_event"));
    }

    #[test]
    fn test_default_thresholds_ordered() {
        for model in PmuModel::all() {
            let t = model.default_thresholds();
            assert!(t.l2 < t.l3, "{model} thresholds out of order");
        }
    }

    #[test]
    fn test_decoder_names_match_models() {
        for model in PmuModel::all() {
            assert_eq!(model.decoder().name(), model.as_str());
        }
    }
}
