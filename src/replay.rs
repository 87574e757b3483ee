//! Offline capture replay.
//!
//! Drives the whole pipeline without a live collector: reads raw buffer
//! snapshot files (or previously recorded binary sample streams), runs
//! them through a session hub, and emits the report(s).

use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;

use crate::config::{Config, OutputMode};
use crate::report::binary::{SampleStreamReader, SampleStreamWriter, MAGIC};
use crate::session::{DrainSummary, Session, SessionHub, SessionOptions, SessionOutput};
use crate::symbol::{ModuleMap, NoSymbols, SymbolResolver};

/// Run the replay described by `cfg`.
pub fn run(cfg: &Config) -> Result<()> {
    let model = cfg.pmu()?;
    let opts = cfg.session_options()?;
    let topology = cfg.topology()?;

    let symbols: Arc<dyn SymbolResolver> = match &cfg.symbol_map {
        Some(path) => Arc::new(
            ModuleMap::load(path)
                .with_context(|| format!("loading symbol map {}", path.display()))?,
        ),
        None => Arc::new(NoSymbols),
    };

    info!(
        pmu_model = %model,
        mode = %opts.mode,
        view = opts.view.as_str(),
        sort = opts.sort.as_str(),
        inputs = cfg.inputs.len(),
        aggregate = opts.aggregate,
        "starting replay"
    );

    let hub = if opts.aggregate {
        let output = open_sink(opts, &cfg.output)?;
        let session = Session::new(
            "aggregate",
            opts,
            model.decoder(),
            &topology,
            Arc::clone(&symbols),
            output,
        )?;
        SessionHub::aggregated(session)
    } else {
        let base_output = cfg.output.clone();
        let target_symbols = Arc::clone(&symbols);
        SessionHub::per_target(move |target| {
            let output = open_sink(opts, &target_path(&base_output, target))?;
            Session::new(
                format!("target-{target}"),
                opts,
                model.decoder(),
                &topology,
                Arc::clone(&target_symbols),
                output,
            )
        })
    };

    for (index, path) in cfg.inputs.iter().enumerate() {
        let raw = fs::read(path)
            .with_context(|| format!("reading capture {}", path.display()))?;
        let target = if opts.aggregate { 0 } else { index as u32 };

        let summary = if is_sample_stream(&raw) {
            replay_stream(&hub, target, &raw)
        } else {
            hub.drain(target, &raw)
        }
        .with_context(|| format!("processing capture {}", path.display()))?;

        info!(
            capture = %path.display(),
            new_samples = summary.new_samples,
            skipped = summary.skipped,
            decode_errors = summary.decode_errors,
            lost = summary.lost,
            "capture drained"
        );
    }

    hub.close_all()
}

/// Whether a capture file is a recorded binary sample stream rather
/// than a raw buffer image.
fn is_sample_stream(raw: &[u8]) -> bool {
    raw.len() >= 4 && raw[0..4] == MAGIC.to_le_bytes()
}

/// Feed a recorded sample stream back through a session.
fn replay_stream(hub: &SessionHub, target: u32, raw: &[u8]) -> Result<DrainSummary> {
    let mut reader = SampleStreamReader::new(Cursor::new(raw)).context("reading sample stream")?;
    let header = reader.header();

    hub.with_session(target, |session| {
        if header.mode != session.mode() {
            bail!(
                "stream was recorded in {} mode but the session expects {}",
                header.mode,
                session.mode()
            );
        }

        let mut summary = DrainSummary::default();
        while let Some(sample) = reader.next_sample().context("reading sample record")? {
            session.absorb(&sample)?;
            summary.new_samples += 1;
        }
        Ok(summary)
    })
}

/// Open the output sink a session renders into.
fn open_sink(opts: SessionOptions, path: &str) -> Result<SessionOutput> {
    match opts.output {
        OutputMode::Text => {
            if path.is_empty() {
                return Ok(SessionOutput::Text(Box::new(io::stdout())));
            }
            let file = File::create(path)
                .with_context(|| format!("creating report file {path}"))?;
            let mut out = BufWriter::new(file);
            writeln!(
                out,
                "# earhist report, generated {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            )
            .context("writing report preamble")?;
            Ok(SessionOutput::Text(Box::new(out)))
        }

        OutputMode::Binary => {
            let file = File::create(path)
                .with_context(|| format!("creating sample stream {path}"))?;
            let writer = SampleStreamWriter::new(file, opts.mode, opts.view)
                .context("writing stream header")?;
            Ok(SessionOutput::Binary(writer))
        }
    }
}

/// Per-target report path: `report.txt` becomes `report.txt.7`.
fn target_path(base: &str, target: u32) -> String {
    if base.is_empty() {
        String::new()
    } else {
        format!("{base}.{target}")
    }
}
