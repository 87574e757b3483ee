use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sample::pmu::PmuModel;
use crate::sample::SamplingMode;
use crate::session::classify::{LevelThresholds, StaticTopology};
use crate::session::SessionOptions;

/// Top-level configuration for the earhist replay tool.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// PMU model whose decoder and event table drive the session.
    pub pmu_model: String,

    /// PMU events programmed for the run. Exactly one must be an
    /// address-sampling (EAR) event; the rest are plain counters.
    #[serde(default)]
    pub events: Vec<String>,

    /// Session view/sort/output configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Raw buffer snapshot files, drained in order.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    /// Report destination. Empty = stdout (text mode only).
    #[serde(default)]
    pub output: String,

    /// Optional symbol map file: one `start end name` line per symbol,
    /// addresses in hex.
    #[serde(default)]
    pub symbol_map: Option<PathBuf>,
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// What the histogram is keyed by. Default: instruction.
    #[serde(default)]
    pub view: ViewMode,

    /// Report row ordering. Default: count.
    #[serde(default)]
    pub sort: SortMode,

    /// Report format. Default: text.
    #[serde(default)]
    pub output: OutputMode,

    /// Fold report rows into their enclosing functions. Default: false.
    #[serde(default)]
    pub fold_symbols: bool,

    /// Maximum report rows. 0 = unlimited.
    #[serde(default)]
    pub row_cap: usize,

    /// Stop the report once the cumulative percentage exceeds this.
    /// Default: 100 (emit everything).
    #[serde(default = "default_cutoff_percent")]
    pub cutoff_percent: f64,

    /// L2 latency threshold in cycles. 0 = PMU model default.
    #[serde(default)]
    pub l2_latency: u32,

    /// L3 latency threshold in cycles. 0 = PMU model default.
    #[serde(default)]
    pub l3_latency: u32,

    /// Merge samples from all inputs into one shared histogram and one
    /// report. When false, each input file is its own target with its
    /// own report. Default: true.
    #[serde(default = "default_true")]
    pub aggregate: bool,
}

/// What the histogram key is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ViewMode {
    Instruction = 0,
    Data = 1,
    Level = 2,
}

impl Default for ViewMode {
    fn default() -> Self {
        Self::Instruction
    }
}

impl ViewMode {
    /// Returns the canonical config/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Data => "data",
            Self::Level => "level",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Instruction),
            1 => Some(Self::Data),
            2 => Some(Self::Level),
            _ => None,
        }
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report row ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SortMode {
    Count = 0,
    Value = 1,
    Level = 2,
}

impl Default for SortMode {
    fn default() -> Self {
        Self::Count
    }
}

impl SortMode {
    /// Returns the canonical config/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Value => "value",
            Self::Level => "level",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OutputMode {
    Text = 0,
    Binary = 1,
}

impl Default for OutputMode {
    fn default() -> Self {
        Self::Text
    }
}

impl OutputMode {
    /// Returns the canonical config/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cutoff_percent() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pmu_model: String::new(),
            events: Vec::new(),
            session: SessionConfig::default(),
            inputs: Vec::new(),
            output: String::new(),
            symbol_map: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            view: ViewMode::default(),
            sort: SortMode::default(),
            output: OutputMode::default(),
            fold_symbols: false,
            row_cap: 0,
            cutoff_percent: default_cutoff_percent(),
            l2_latency: 0,
            l3_latency: 0,
            aggregate: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let model = self.pmu()?;

        if self.events.is_empty() {
            bail!("events is required: configure one address-sampling event");
        }

        let mut sampling_events = Vec::new();
        for name in &self.events {
            match model.classify_event(name) {
                Some(_) => sampling_events.push(name.as_str()),
                None => {
                    if !model.is_counting_event(name) {
                        bail!("unknown event for {model}: {name}");
                    }
                }
            }
        }

        match sampling_events.len() {
            0 => bail!("no address-sampling event configured"),
            1 => {}
            _ => bail!(
                "more than one address-sampling event configured: {}",
                sampling_events.join(", ")
            ),
        }

        // Session option compatibility is rechecked at session start;
        // failing here keeps errors close to the file that caused them.
        self.session_options()?.validate()?;

        let t = self.thresholds()?;
        if t.l2 >= t.l3 {
            bail!("l2_latency ({}) must be below l3_latency ({})", t.l2, t.l3);
        }

        if self.inputs.is_empty() {
            bail!("inputs is required: list at least one capture file");
        }

        if self.session.output == OutputMode::Binary && self.output.is_empty() {
            bail!("binary output requires an output file, not stdout");
        }

        Ok(())
    }

    /// The configured PMU model.
    pub fn pmu(&self) -> Result<PmuModel> {
        match PmuModel::from_name(&self.pmu_model) {
            Some(model) => Ok(model),
            None => {
                let known: Vec<&str> = PmuModel::all().iter().map(|m| m.as_str()).collect();
                bail!(
                    "unknown pmu_model {:?} (known: {})",
                    self.pmu_model,
                    known.join(", ")
                );
            }
        }
    }

    /// Sampling mode of the single configured EAR event.
    pub fn sampling_mode(&self) -> Result<SamplingMode> {
        let model = self.pmu()?;
        let mut found = None;
        for name in &self.events {
            if let Some(mode) = model.classify_event(name) {
                if found.is_some() {
                    bail!("more than one address-sampling event configured");
                }
                found = Some(mode);
            }
        }
        match found {
            Some(mode) => Ok(mode),
            None => bail!("no address-sampling event configured"),
        }
    }

    /// Latency thresholds: configured values, with zeros filled from
    /// the PMU model defaults.
    pub fn thresholds(&self) -> Result<LevelThresholds> {
        let defaults = self.pmu()?.default_thresholds();
        Ok(LevelThresholds {
            l2: if self.session.l2_latency == 0 {
                defaults.l2
            } else {
                self.session.l2_latency
            },
            l3: if self.session.l3_latency == 0 {
                defaults.l3
            } else {
                self.session.l3_latency
            },
        })
    }

    /// The platform cache description consulted at session start.
    pub fn topology(&self) -> Result<StaticTopology> {
        Ok(StaticTopology(self.thresholds()?))
    }

    /// Resolved session options.
    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            mode: self.sampling_mode()?,
            view: self.session.view,
            sort: self.session.sort,
            output: self.session.output,
            fold_symbols: self.session.fold_symbols,
            row_cap: match self.session.row_cap {
                0 => None,
                n => Some(n),
            },
            cutoff_percent: self.session.cutoff_percent,
            aggregate: self.session.aggregate,
        })
    }
}
