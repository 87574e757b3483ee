//! Report ordering and text rendering.
//!
//! Takes a flat snapshot of the histogram table, optionally folds
//! entries into their enclosing functions, orders them, and writes the
//! percentage-annotated rows to an output sink.

pub mod binary;

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};

use crate::config::{SortMode, ViewMode};
use crate::sample::{Level, SamplingMode, LEVEL_COUNT};
use crate::session::table::{HistEntry, HistKey};
use crate::symbol::SymbolResolver;

/// Rendering options resolved from the session configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    pub mode: SamplingMode,
    pub view: ViewMode,
    pub sort: SortMode,
    /// Maximum rows to emit; `None` = unlimited.
    pub row_cap: Option<usize>,
    /// Stop emitting once the cumulative percentage exceeds this.
    pub cutoff_percent: f64,
}

impl ReportOptions {
    /// Per-level percentages are only meaningful outside the level view.
    pub fn show_levels(&self) -> bool {
        self.view != ViewMode::Level
    }
}

/// Fold related entries into their enclosing function: every key whose
/// value resolves to a symbol is re-keyed to the symbol's start
/// address, merging counters. Unresolved keys pass through unchanged.
pub fn fold_rows(
    rows: Vec<(HistKey, HistEntry)>,
    symbols: &dyn SymbolResolver,
) -> Vec<(HistKey, HistEntry)> {
    let mut folded: HashMap<HistKey, HistEntry> = HashMap::with_capacity(rows.len());

    for (key, entry) in rows {
        let target = match symbols.resolve(key.pid, key.value) {
            Some(sym) => HistKey {
                value: sym.start,
                ..key
            },
            None => key,
        };

        let acc = folded.entry(target).or_default();
        acc.total += entry.total;
        for (dst, src) in acc.levels.iter_mut().zip(entry.levels) {
            *dst += src;
        }
    }

    folded.into_iter().collect()
}

/// Estimated total cost of one entry, used by the by-level ordering.
pub fn estimated_cost(entry: &HistEntry, costs: [u64; LEVEL_COUNT]) -> u64 {
    let weighted: u64 = entry
        .levels
        .iter()
        .zip(costs)
        .map(|(n, c)| n.saturating_mul(c))
        .sum();
    entry.total.saturating_mul(weighted)
}

/// Order a snapshot in place. Ties break on key value, then pid/tid,
/// so repeated sorts of the same snapshot are identical.
pub fn sort_rows(rows: &mut [(HistKey, HistEntry)], sort: SortMode, mode: SamplingMode) {
    let by_key = |a: &HistKey, b: &HistKey| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.pid.cmp(&b.pid))
            .then_with(|| a.tid.cmp(&b.tid))
            .then_with(|| a.map_version.cmp(&b.map_version))
    };

    match sort {
        SortMode::Count => rows.sort_by(|a, b| {
            b.1.total
                .cmp(&a.1.total)
                .then_with(|| by_key(&a.0, &b.0))
        }),
        SortMode::Value => rows.sort_by(|a, b| by_key(&a.0, &b.0)),
        SortMode::Level => {
            let costs = mode.level_costs();
            rows.sort_by(|a, b| {
                estimated_cost(&b.1, costs)
                    .cmp(&estimated_cost(&a.1, costs))
                    .then_with(|| by_key(&a.0, &b.0))
            });
        }
    }
}

/// Render an ordered snapshot as a text report.
///
/// Percentages are relative to the whole snapshot, so a row cap or
/// cumulative cutoff never changes the numbers of the rows it keeps.
pub fn render(
    out: &mut dyn Write,
    rows: &[(HistKey, HistEntry)],
    opts: &ReportOptions,
    symbols: &dyn SymbolResolver,
) -> Result<()> {
    let grand_total: u64 = rows.iter().map(|(_, e)| e.total).sum();

    writeln!(
        out,
        "# {} samples, {} values, {} sampling, {} view, sorted by {}",
        grand_total,
        rows.len(),
        opts.mode.as_str(),
        opts.view.as_str(),
        opts.sort.as_str(),
    )
    .context("writing report header")?;

    if grand_total == 0 {
        writeln!(out, "# no samples").context("writing report header")?;
        return Ok(());
    }

    if opts.show_levels() {
        writeln!(
            out,
            "#{:>11} {:>8} {:>8} {:>7} {:>7} {:>7}  {:>11}  value",
            "count",
            "pct%",
            "cum%",
            opts.mode.level_label(Level::Near),
            opts.mode.level_label(Level::Far),
            opts.mode.level_label(Level::Mem),
            "pid:tid",
        )
        .context("writing report header")?;
    } else {
        writeln!(
            out,
            "#{:>11} {:>8} {:>8}  {:>11}  value",
            "count", "pct%", "cum%", "pid:tid",
        )
        .context("writing report header")?;
    }

    let cap = opts.row_cap.unwrap_or(usize::MAX);
    let mut cum_pct = 0.0f64;

    for (key, entry) in rows.iter().take(cap) {
        let rel_pct = entry.total as f64 * 100.0 / grand_total as f64;
        cum_pct += rel_pct;

        if opts.show_levels() {
            let level_pct = |i: usize| entry.levels[i] as f64 * 100.0 / entry.total as f64;
            writeln!(
                out,
                " {:>11} {:>7.2}% {:>7.2}% {:>6.2}% {:>6.2}% {:>6.2}%  {:>5}:{:<5}  {}",
                entry.total,
                rel_pct,
                cum_pct,
                level_pct(0),
                level_pct(1),
                level_pct(2),
                key.pid,
                key.tid,
                value_label(key, opts, symbols),
            )
            .context("writing report row")?;
        } else {
            writeln!(
                out,
                " {:>11} {:>7.2}% {:>7.2}%  {:>5}:{:<5}  {}",
                entry.total,
                rel_pct,
                cum_pct,
                key.pid,
                key.tid,
                value_label(key, opts, symbols),
            )
            .context("writing report row")?;
        }

        if cum_pct > opts.cutoff_percent {
            break;
        }
    }

    out.flush().context("flushing report")?;
    Ok(())
}

/// Human-readable form of one key value.
fn value_label(key: &HistKey, opts: &ReportOptions, symbols: &dyn SymbolResolver) -> String {
    match opts.view {
        ViewMode::Level => match opts.mode {
            SamplingMode::Cache => format!("{} cycles", key.value),
            SamplingMode::Tlb => opts
                .mode
                .level_label(Level::from_index(key.value as usize))
                .to_string(),
        },
        ViewMode::Instruction | ViewMode::Data => match symbols.resolve(key.pid, key.value) {
            Some(sym) => {
                let offset = key.value - sym.start;
                if offset == 0 {
                    sym.name.to_string()
                } else {
                    format!("{}+0x{offset:x}", sym.name)
                }
            }
            None => format!("0x{:016x}", key.value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{ModuleMap, NoSymbols};

    fn key(value: u64) -> HistKey {
        HistKey {
            value,
            pid: 100,
            tid: 100,
            map_version: 0,
        }
    }

    fn entry(total: u64, levels: [u64; 3]) -> HistEntry {
        HistEntry { total, levels }
    }

    fn options() -> ReportOptions {
        ReportOptions {
            mode: SamplingMode::Cache,
            view: ViewMode::Instruction,
            sort: SortMode::Count,
            row_cap: None,
            cutoff_percent: 100.0,
        }
    }

    fn render_to_string(rows: &[(HistKey, HistEntry)], opts: &ReportOptions) -> String {
        let mut out = Vec::new();
        render(&mut out, rows, opts, &NoSymbols).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_sort_by_count_descending() {
        let mut rows = vec![
            (key(0x1000), entry(1, [1, 0, 0])),
            (key(0x2000), entry(5, [5, 0, 0])),
            (key(0x3000), entry(3, [3, 0, 0])),
        ];
        sort_rows(&mut rows, SortMode::Count, SamplingMode::Cache);
        let totals: Vec<u64> = rows.iter().map(|(_, e)| e.total).collect();
        assert_eq!(totals, vec![5, 3, 1]);
    }

    #[test]
    fn test_sort_by_value_ascending() {
        let mut rows = vec![
            (key(0x3000), entry(1, [1, 0, 0])),
            (key(0x1000), entry(5, [5, 0, 0])),
            (key(0x2000), entry(3, [3, 0, 0])),
        ];
        sort_rows(&mut rows, SortMode::Value, SamplingMode::Cache);
        let values: Vec<u64> = rows.iter().map(|(k, _)| k.value).collect();
        assert_eq!(values, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_sort_by_level_weighs_costly_levels() {
        // Same totals; the memory-heavy entry must sort first.
        let mut rows = vec![
            (key(0x1000), entry(4, [4, 0, 0])),
            (key(0x2000), entry(4, [0, 0, 4])),
        ];
        sort_rows(&mut rows, SortMode::Level, SamplingMode::Cache);
        assert_eq!(rows[0].0.value, 0x2000);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut rows = vec![
            (key(0x1000), entry(2, [2, 0, 0])),
            (key(0x2000), entry(2, [0, 2, 0])),
            (key(0x3000), entry(1, [1, 0, 0])),
        ];
        sort_rows(&mut rows, SortMode::Count, SamplingMode::Cache);
        let first = rows.clone();
        sort_rows(&mut rows, SortMode::Count, SamplingMode::Cache);
        assert_eq!(rows, first);
    }

    #[test]
    fn test_estimated_cost_formula() {
        let e = entry(4, [2, 1, 1]);
        // 4 * (2*5 + 1*10 + 1*150) = 680
        assert_eq!(estimated_cost(&e, SamplingMode::Cache.level_costs()), 680);
    }

    #[test]
    fn test_render_percentages() {
        let rows = vec![
            (key(0x1000), entry(2, [2, 0, 0])),
            (key(0x2000), entry(1, [1, 0, 0])),
        ];
        let text = render_to_string(&rows, &options());

        assert!(text.contains("66.67%"), "relative pct missing:\n{text}");
        assert!(text.contains("100.00%"), "cumulative pct missing:\n{text}");
        assert!(text.contains("0x0000000000001000"));
    }

    #[test]
    fn test_render_cumulative_is_non_decreasing() {
        let rows: Vec<_> = (0..20)
            .map(|i| (key(0x1000 + i * 16), entry(i + 1, [i + 1, 0, 0])))
            .collect();
        let text = render_to_string(&rows, &options());

        let mut last = 0.0f64;
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let cum: f64 = fields[2].trim_end_matches('%').parse().unwrap();
            assert!(cum >= last - 1e-9, "cumulative went backward:\n{text}");
            assert!(cum <= 100.0 + 1e-6);
            last = cum;
        }
        assert!((last - 100.0).abs() < 0.05);
    }

    #[test]
    fn test_render_row_cap() {
        let rows: Vec<_> = (0..10)
            .map(|i| (key(0x1000 + i * 16), entry(10 - i, [10 - i, 0, 0])))
            .collect();
        let mut opts = options();
        opts.row_cap = Some(3);
        let text = render_to_string(&rows, &opts);

        let data_lines = text.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(data_lines, 3);
    }

    #[test]
    fn test_render_cutoff_stops_after_crossing() {
        let rows = vec![
            (key(0x1000), entry(60, [60, 0, 0])),
            (key(0x2000), entry(30, [30, 0, 0])),
            (key(0x3000), entry(10, [10, 0, 0])),
        ];
        let mut opts = options();
        opts.cutoff_percent = 80.0;
        let text = render_to_string(&rows, &opts);

        // 60% then 90% (crossing row included), third row suppressed.
        let data_lines = text.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(data_lines, 2);
    }

    #[test]
    fn test_render_level_view_omits_level_columns() {
        let rows = vec![(key(9), entry(4, [0, 0, 0]))];
        let mut opts = options();
        opts.view = ViewMode::Level;
        let text = render_to_string(&rows, &opts);

        assert!(text.contains("9 cycles"));
        assert!(!text.contains("mem"), "level columns leaked:\n{text}");
    }

    #[test]
    fn test_render_resolves_symbols() {
        let mut map = ModuleMap::new();
        map.insert(0x4000, 0x4100, "main");

        let rows = vec![(key(0x4010), entry(1, [1, 0, 0]))];
        let mut out = Vec::new();
        render(&mut out, &rows, &options(), &map).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("main+0x10"), "symbol missing:\n{text}");
    }

    #[test]
    fn test_fold_merges_same_function() {
        let mut map = ModuleMap::new();
        map.insert(0x4000, 0x4100, "main");

        let rows = vec![
            (key(0x4010), entry(2, [2, 0, 0])),
            (key(0x4020), entry(3, [0, 3, 0])),
            (key(0x9000), entry(1, [1, 0, 0])), // unresolved, passes through
        ];
        let mut folded = fold_rows(rows, &map);
        sort_rows(&mut folded, SortMode::Value, SamplingMode::Cache);

        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].0.value, 0x4000);
        assert_eq!(folded[0].1.total, 5);
        assert_eq!(folded[0].1.levels, [2, 3, 0]);
        assert_eq!(folded[1].0.value, 0x9000);
    }

    #[test]
    fn test_fold_keeps_processes_apart() {
        let mut map = ModuleMap::new();
        map.insert(0x4000, 0x4100, "main");

        let rows = vec![
            (key(0x4010), entry(2, [2, 0, 0])),
            (
                HistKey {
                    pid: 200,
                    ..key(0x4020)
                },
                entry(3, [3, 0, 0]),
            ),
        ];
        let folded = fold_rows(rows, &map);
        assert_eq!(folded.len(), 2);
    }

    #[test]
    fn test_render_empty_snapshot() {
        let text = render_to_string(&[], &options());
        assert!(text.contains("no samples"));
    }
}
