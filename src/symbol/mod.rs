//! Symbol resolution collaborator.
//!
//! The engine delegates address-to-name rendering and function-level
//! folding to a [`SymbolResolver`]. The resolver's map version feeds
//! the histogram key so samples from different process images never
//! merge.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

/// A resolved symbol: the enclosing function's start address and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRef {
    pub start: u64,
    pub name: Arc<str>,
}

/// Resolves sample addresses to symbols.
pub trait SymbolResolver: Send + Sync {
    /// Resolve an address to its enclosing symbol, if known.
    fn resolve(&self, pid: u32, addr: u64) -> Option<SymbolRef>;

    /// Current symbol-map version for the process. Bumps when the
    /// process image changes (exec, module load churn).
    fn map_version(&self, pid: u32) -> u32;
}

/// Resolver with no symbol information; addresses render raw.
#[derive(Debug, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _pid: u32, _addr: u64) -> Option<SymbolRef> {
        None
    }

    fn map_version(&self, _pid: u32) -> u32 {
        0
    }
}

/// In-memory symbol table over sorted, non-overlapping `[start, end)`
/// ranges, shared by all processes of one monitored image.
#[derive(Debug, Default)]
pub struct ModuleMap {
    syms: Vec<(u64, u64, Arc<str>)>,
    version: AtomicU32,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a symbol map file: one `start end name` line per symbol,
    /// addresses in hex, `#` comments and blank lines ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading symbol map {}", path.display()))?;

        let mut map = Self::new();
        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                bail!("{}:{}: expected 'start end name'", path.display(), lineno + 1);
            }

            let start = parse_hex(fields[0])
                .with_context(|| format!("{}:{}: bad start address", path.display(), lineno + 1))?;
            let end = parse_hex(fields[1])
                .with_context(|| format!("{}:{}: bad end address", path.display(), lineno + 1))?;
            if end <= start {
                bail!("{}:{}: empty symbol range", path.display(), lineno + 1);
            }

            // Demangled names can contain spaces.
            map.insert(start, end, &fields[2..].join(" "));
        }

        Ok(map)
    }

    /// Insert one symbol range, keeping the table sorted by start.
    pub fn insert(&mut self, start: u64, end: u64, name: &str) {
        let idx = self.syms.partition_point(|&(s, _, _)| s < start);
        self.syms.insert(idx, (start, end, Arc::from(name)));
    }

    /// Number of symbols in the map.
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Advance the map version, marking a new process-image epoch.
    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }
}

fn parse_hex(s: &str) -> Result<u64> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(trimmed, 16).with_context(|| format!("invalid hex address {s:?}"))
}

impl SymbolResolver for ModuleMap {
    fn resolve(&self, _pid: u32, addr: u64) -> Option<SymbolRef> {
        let idx = self.syms.partition_point(|&(start, _, _)| start <= addr);
        if idx == 0 {
            return None;
        }
        let (start, end, ref name) = self.syms[idx - 1];
        if addr < end {
            Some(SymbolRef {
                start,
                name: Arc::clone(name),
            })
        } else {
            None
        }
    }

    fn map_version(&self, _pid: u32) -> u32 {
        self.version.load(Ordering::Relaxed)
    }
}
