//! Aggregation sessions.
//!
//! A [`Session`] owns the histogram table, the drain watermark, and the
//! output sink for one monitored target (or one aggregated group of
//! targets). Drains are synchronous: each call decodes the new portion
//! of a buffer image, classifies and aggregates it, and the final
//! report is rendered when the session closes. The [`SessionHub`] wraps
//! sessions in the locking discipline each mode needs.

pub mod classify;
pub mod table;

use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{OutputMode, SortMode, ViewMode};
use crate::report::binary::SampleStreamWriter;
use crate::report::{self, ReportOptions};
use crate::sample::buffer::{self, RawBuffer, Watermark};
use crate::sample::decode::PmuDecoder;
use crate::sample::stats::DrainStats;
use crate::sample::SamplingMode;
use crate::symbol::SymbolResolver;

use self::classify::{classify, CacheTopology, LevelThresholds};
use self::table::{HistKey, HistTable};

/// Resolved session configuration, passed explicitly into session
/// creation rather than read from ambient state.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub mode: SamplingMode,
    pub view: ViewMode,
    pub sort: SortMode,
    pub output: OutputMode,
    /// Fold report rows into their enclosing functions.
    pub fold_symbols: bool,
    /// Maximum report rows; `None` = unlimited.
    pub row_cap: Option<usize>,
    /// Stop the report once the cumulative percentage exceeds this.
    pub cutoff_percent: f64,
    /// Merge samples from all monitored targets into one table.
    pub aggregate: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Cache,
            view: ViewMode::Instruction,
            sort: SortMode::Count,
            output: OutputMode::Text,
            fold_symbols: false,
            row_cap: None,
            cutoff_percent: 100.0,
            aggregate: false,
        }
    }
}

impl SessionOptions {
    /// Reject option combinations that cannot produce a meaningful
    /// report. Checked at session start, never during a drain.
    pub fn validate(&self) -> Result<()> {
        if self.fold_symbols && self.view != ViewMode::Instruction {
            bail!(
                "symbol folding requires the instruction view, not the {} view",
                self.view.as_str()
            );
        }

        if self.fold_symbols && self.output == OutputMode::Binary {
            bail!("symbol folding is not available with binary output");
        }

        if self.sort == SortMode::Level && self.view == ViewMode::Level {
            bail!("by-level ordering needs per-level sub-counts, which the level view does not track");
        }

        if !(self.cutoff_percent > 0.0 && self.cutoff_percent <= 100.0) {
            bail!(
                "cutoff_percent must be in (0, 100], got {}",
                self.cutoff_percent
            );
        }

        Ok(())
    }

    fn report_options(&self) -> ReportOptions {
        ReportOptions {
            mode: self.mode,
            view: self.view,
            sort: self.sort,
            row_cap: self.row_cap,
            cutoff_percent: self.cutoff_percent,
        }
    }
}

/// Where a session's results go.
pub enum SessionOutput {
    /// Text report sink, written once at close.
    Text(Box<dyn Write + Send>),
    /// Raw decoded-sample stream, count back-patched at close.
    Binary(SampleStreamWriter<File>),
}

/// Session lifecycle. Finalization happens inside `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Draining,
    Closed,
}

/// Outcome of one drain call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Samples decoded and processed by this drain.
    pub new_samples: u64,
    /// Entries the decoder rejected.
    pub decode_errors: u64,
    /// Leading entries skipped as already processed.
    pub skipped: u64,
    /// The buffer wrapped past the watermark with data loss.
    pub lost: bool,
}

/// One aggregation session.
pub struct Session {
    label: String,
    opts: SessionOptions,
    thresholds: LevelThresholds,
    decoder: Box<dyn PmuDecoder>,
    symbols: Arc<dyn SymbolResolver>,
    table: HistTable,
    watermark: Watermark,
    stats: DrainStats,
    state: SessionState,
    /// Symbol-map epoch seen on the previous sample; `None` before the
    /// first sample arrives.
    map_version: Option<u32>,
    output: Option<SessionOutput>,
}

impl Session {
    /// Create a session. The cache topology is consulted exactly once,
    /// here; configuration errors abort before any drain can run.
    pub fn new(
        label: impl Into<String>,
        opts: SessionOptions,
        decoder: Box<dyn PmuDecoder>,
        topology: &dyn CacheTopology,
        symbols: Arc<dyn SymbolResolver>,
        output: SessionOutput,
    ) -> Result<Self> {
        opts.validate()?;

        let thresholds = topology.thresholds();
        if opts.mode == SamplingMode::Cache && thresholds.l2 >= thresholds.l3 {
            bail!(
                "cache thresholds out of order: l2={} l3={}",
                thresholds.l2,
                thresholds.l3
            );
        }

        match (&output, opts.output) {
            (SessionOutput::Text(_), OutputMode::Text)
            | (SessionOutput::Binary(_), OutputMode::Binary) => {}
            _ => bail!("output sink does not match the configured output mode"),
        }

        Ok(Self {
            label: label.into(),
            opts,
            thresholds,
            decoder,
            symbols,
            table: HistTable::new(opts.view != ViewMode::Level),
            watermark: Watermark::INITIAL,
            stats: DrainStats::new(),
            state: SessionState::Created,
            map_version: None,
            output: Some(output),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The sampling mode this session classifies with.
    pub fn mode(&self) -> SamplingMode {
        self.opts.mode
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Distinct keys currently in the table.
    pub fn distinct_values(&self) -> usize {
        self.table.len()
    }

    /// Samples aggregated since the last table reset.
    pub fn total_samples(&self) -> u64 {
        self.table.total_samples()
    }

    /// Process the current image of this target's sample buffer,
    /// aggregating (or streaming, in binary mode) every entry that is
    /// new since the previous drain.
    pub fn drain(&mut self, raw: &[u8]) -> Result<DrainSummary> {
        if self.state == SessionState::Closed {
            bail!("session {} is closed", self.label);
        }
        self.state = SessionState::Draining;

        let buf = RawBuffer::parse(raw).context("parsing sample buffer")?;
        let decoder = &*self.decoder;
        let drained = buffer::drain(&buf, &mut self.watermark, decoder);

        let mut summary = DrainSummary {
            skipped: drained.skipped,
            lost: drained.lost,
            ..Default::default()
        };
        self.stats.record_seen(drained.remaining());
        self.stats.record_skipped(drained.skipped);
        if drained.lost {
            self.stats.record_lossy_drain();
        }

        match &mut self.output {
            // Binary mode: watermark tracking above still ran; samples
            // stream out without touching the table.
            Some(SessionOutput::Binary(writer)) => {
                for item in drained {
                    match item {
                        Ok(sample) => {
                            writer
                                .write_sample(&sample)
                                .context("writing sample stream")?;
                            summary.new_samples += 1;
                        }
                        Err(e) => {
                            summary.decode_errors += 1;
                            debug!(error = %e, "skipping undecodable sample entry");
                        }
                    }
                }
            }

            _ => {
                let expected = usize::try_from(drained.remaining()).unwrap_or(usize::MAX);
                self.table
                    .try_grow(expected)
                    .map_err(|e| anyhow!("cannot grow histogram table: {e}"))?;

                for item in drained {
                    match item {
                        Ok(sample) => {
                            aggregate_one(
                                &mut self.table,
                                &mut self.map_version,
                                &self.opts,
                                self.thresholds,
                                &*self.symbols,
                                &self.label,
                                &sample,
                            );
                            summary.new_samples += 1;
                        }
                        Err(e) => {
                            summary.decode_errors += 1;
                            debug!(error = %e, "skipping undecodable sample entry");
                        }
                    }
                }
            }
        }

        self.stats.record_decoded(summary.new_samples);
        self.stats.record_decode_errors(summary.decode_errors);

        debug!(
            label = %self.label,
            new_samples = summary.new_samples,
            skipped = summary.skipped,
            decode_errors = summary.decode_errors,
            "drained sample buffer"
        );

        Ok(summary)
    }

    /// Process one already-decoded sample, e.g. replayed from a
    /// recorded binary stream. Aggregates in text mode, re-streams in
    /// binary mode.
    pub fn absorb(&mut self, sample: &crate::sample::Sample) -> Result<()> {
        if self.state == SessionState::Closed {
            bail!("session {} is closed", self.label);
        }
        self.state = SessionState::Draining;

        match &mut self.output {
            Some(SessionOutput::Binary(writer)) => {
                writer
                    .write_sample(sample)
                    .context("writing sample stream")?;
            }
            _ => {
                aggregate_one(
                    &mut self.table,
                    &mut self.map_version,
                    &self.opts,
                    self.thresholds,
                    &*self.symbols,
                    &self.label,
                    sample,
                );
            }
        }

        self.stats.record_seen(1);
        self.stats.record_decoded(1);
        Ok(())
    }

    /// Finalize the session: render the report (or back-patch the
    /// binary stream) and free the table. A failed text render leaves
    /// the session open with its state intact so the caller may retry.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            bail!("session {} already closed", self.label);
        }

        if matches!(self.output, Some(SessionOutput::Binary(_))) {
            if let Some(SessionOutput::Binary(writer)) = self.output.take() {
                // The stream writer is consumed either way.
                self.state = SessionState::Closed;
                writer.finish().context("finalizing sample stream")?;
            }
        } else if let Some(SessionOutput::Text(out)) = self.output.as_mut() {
            let rows = self
                .table
                .snapshot()
                .map_err(|e| anyhow!("cannot snapshot histogram table: {e}"))?;

            let mut rows = if self.opts.fold_symbols {
                report::fold_rows(rows, &*self.symbols)
            } else {
                rows
            };
            report::sort_rows(&mut rows, self.opts.sort, self.opts.mode);

            if let Err(e) = report::render(
                &mut **out,
                &rows,
                &self.opts.report_options(),
                &*self.symbols,
            ) {
                warn!(label = %self.label, error = %e, "failed to write report");
                return Err(e);
            }
        }

        let distinct_values = self.table.len();
        let snap = self.stats.snapshot();
        self.table.clear();
        self.output = None;
        self.state = SessionState::Closed;

        info!(
            label = %self.label,
            samples = snap.samples_decoded,
            distinct_values,
            skipped = snap.entries_skipped,
            decode_errors = snap.decode_errors,
            lossy_drains = snap.lossy_drains,
            "session closed"
        );

        Ok(())
    }
}

/// Classify and record one decoded sample.
///
/// Split out of [`Session`] so the drain loop can hold the decoder
/// borrow while mutating the table through disjoint fields.
fn aggregate_one(
    table: &mut HistTable,
    last_map_version: &mut Option<u32>,
    opts: &SessionOptions,
    thresholds: LevelThresholds,
    symbols: &dyn SymbolResolver,
    label: &str,
    sample: &crate::sample::Sample,
) {
    let map_version = symbols.map_version(sample.pid);

    // A new process image invalidates every address in a single-target
    // table. Aggregated tables keep old epochs apart through the key
    // instead.
    if !opts.aggregate {
        if let Some(current) = *last_map_version {
            if current != map_version {
                info!(
                    label,
                    old_version = current,
                    new_version = map_version,
                    "symbol map changed, resetting histogram"
                );
                table.clear();
            }
        }
        *last_map_version = Some(map_version);
    }

    let value = match opts.view {
        ViewMode::Instruction => sample.payload.instr_address,
        ViewMode::Data => sample.payload.data_address,
        ViewMode::Level => match opts.mode {
            SamplingMode::Cache => u64::from(sample.payload.latency),
            SamplingMode::Tlb => u64::from(sample.payload.hw_level),
        },
    };

    let level = classify(
        opts.mode,
        thresholds,
        sample.payload.latency,
        sample.payload.hw_level,
    );

    table.record(
        HistKey {
            value,
            pid: sample.pid,
            tid: sample.tid,
            map_version,
        },
        level,
    );
}

type SessionFactory = Box<dyn Fn(u32) -> Result<Session> + Send + Sync>;

/// Dispatches drains to sessions under each mode's locking discipline.
///
/// In aggregated mode every drain shares one session; the mutex is held
/// for the full decode+aggregate sequence so concurrent targets
/// serialize on the shared table. In per-target mode each target gets
/// its own session on first sight and targets never contend.
pub enum SessionHub {
    Aggregated(Mutex<Session>),
    PerTarget {
        make: SessionFactory,
        sessions: DashMap<u32, Mutex<Session>>,
    },
}

impl SessionHub {
    /// All targets share `session`.
    pub fn aggregated(session: Session) -> Self {
        Self::Aggregated(Mutex::new(session))
    }

    /// Each new target id gets a session from `make`.
    pub fn per_target(make: impl Fn(u32) -> Result<Session> + Send + Sync + 'static) -> Self {
        Self::PerTarget {
            make: Box::new(make),
            sessions: DashMap::new(),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        match self {
            Self::Aggregated(_) => 1,
            Self::PerTarget { sessions, .. } => sessions.len(),
        }
    }

    /// Run `f` against the session for `target`, under the lock that
    /// serializes access to it. The aggregated session is created up
    /// front; per-target sessions are created on first sight.
    pub fn with_session<T>(
        &self,
        target: u32,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        match self {
            Self::Aggregated(session) => {
                let mut session = session
                    .lock()
                    .map_err(|_| anyhow!("aggregated session lock poisoned"))?;
                f(&mut *session)
            }

            Self::PerTarget { make, sessions } => {
                if !sessions.contains_key(&target) {
                    let session = make(target)?;
                    sessions.entry(target).or_insert_with(|| Mutex::new(session));
                }

                let cell = sessions
                    .get(&target)
                    .ok_or_else(|| anyhow!("session for target {target} disappeared"))?;
                let mut session = cell
                    .lock()
                    .map_err(|_| anyhow!("session lock poisoned for target {target}"))?;
                f(&mut *session)
            }
        }
    }

    /// Drain one target's buffer image.
    pub fn drain(&self, target: u32, raw: &[u8]) -> Result<DrainSummary> {
        self.with_session(target, |session| session.drain(raw))
    }

    /// Close every session, emitting reports. All sessions are
    /// attempted; the first error is returned.
    pub fn close_all(&self) -> Result<()> {
        let mut first_err = None;

        match self {
            Self::Aggregated(session) => match session.lock() {
                Ok(mut session) => {
                    if let Err(e) = session.close() {
                        warn!(label = session.label(), error = %e, "session close failed");
                        first_err = Some(e);
                    }
                }
                Err(_) => first_err = Some(anyhow!("aggregated session lock poisoned")),
            },

            Self::PerTarget { sessions, .. } => {
                for cell in sessions.iter() {
                    match cell.value().lock() {
                        Ok(mut session) => {
                            if let Err(e) = session.close() {
                                warn!(
                                    target = *cell.key(),
                                    error = %e,
                                    "session close failed"
                                );
                                if first_err.is_none() {
                                    first_err = Some(e);
                                }
                            }
                        }
                        Err(_) => {
                            if first_err.is_none() {
                                first_err = Some(anyhow!(
                                    "session lock poisoned for target {}",
                                    cell.key()
                                ));
                            }
                        }
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::pmu::PmuModel;
    use crate::session::classify::StaticTopology;
    use crate::symbol::{ModuleMap, NoSymbols};
    use std::io;

    const ENTRY_SIZE: u32 = 48;
    const THRESHOLDS: LevelThresholds = LevelThresholds { l2: 5, l3: 14 };

    /// Shared in-memory sink whose contents survive the session.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().expect("buf lock").clone()).expect("utf8 report")
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buf lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Sink that always fails, for report-failure paths.
    struct FailWriter;

    impl Write for FailWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "sink unavailable"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn entry(pid: u32, iaddr: u64, daddr: u64, latency: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENTRY_SIZE as usize);
        buf.extend_from_slice(&pid.to_le_bytes());
        buf.extend_from_slice(&pid.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&iaddr.to_le_bytes());
        buf.extend_from_slice(&daddr.to_le_bytes());
        buf.extend_from_slice(&iaddr.to_le_bytes());
        let status = 1u64 | (latency << 2);
        buf.extend_from_slice(&status.to_le_bytes());
        buf
    }

    fn build(total: u64, overflows: u64, entries: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&overflows.to_le_bytes());
        buf.extend_from_slice(&ENTRY_SIZE.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        for e in entries {
            buf.extend_from_slice(e);
        }
        buf
    }

    fn text_session(opts: SessionOptions, sink: SharedBuf) -> Session {
        Session::new(
            "test",
            opts,
            PmuModel::Itanium2.decoder(),
            &StaticTopology(THRESHOLDS),
            Arc::new(NoSymbols),
            SessionOutput::Text(Box::new(sink)),
        )
        .expect("session")
    }

    #[test]
    fn test_drain_aggregates_by_address() {
        let sink = SharedBuf::default();
        let mut session = text_session(SessionOptions::default(), sink.clone());

        let data = build(
            3,
            0,
            &[
                entry(100, 0x4010, 0x8000, 3),
                entry(100, 0x4010, 0x8020, 3),
                entry(100, 0x4020, 0x8040, 3),
            ],
        );
        let summary = session.drain(&data).expect("drain");

        assert_eq!(summary.new_samples, 3);
        assert_eq!(summary.skipped, 0);
        assert!(!summary.lost);
        assert_eq!(session.distinct_values(), 2);
        assert_eq!(session.total_samples(), 3);
        assert_eq!(session.state(), SessionState::Draining);

        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);

        let text = sink.contents();
        assert!(text.contains("66.67%"), "report:\n{text}");
        assert!(text.contains("100.00%"), "report:\n{text}");
    }

    #[test]
    fn test_repeated_drains_skip_seen_entries() {
        let sink = SharedBuf::default();
        let mut session = text_session(SessionOptions::default(), sink);

        let e1 = entry(100, 0x4010, 0x8000, 3);
        let e2 = entry(100, 0x4020, 0x8020, 3);
        let e3 = entry(100, 0x4030, 0x8040, 3);

        let s1 = session.drain(&build(2, 0, &[e1.clone(), e2.clone()])).expect("drain 1");
        assert_eq!(s1.new_samples, 2);

        let s2 = session.drain(&build(3, 0, &[e1, e2, e3])).expect("drain 2");
        assert_eq!(s2.new_samples, 1);
        assert_eq!(s2.skipped, 2);

        assert_eq!(session.total_samples(), 3);
        assert_eq!(session.watermark(), Watermark { count: 3, overflows: 0 });
    }

    #[test]
    fn test_lossy_wrap_processes_all_visible_entries() {
        let sink = SharedBuf::default();
        let mut session = text_session(SessionOptions::default(), sink);

        // Ten entries seen, then the buffer wrapped twice.
        let entries: Vec<_> = (0..10).map(|i| entry(100, 0x4000 + i * 16, 0x8000, 3)).collect();
        session.drain(&build(10, 0, &entries)).expect("drain 1");

        let survivors: Vec<_> = (0..5).map(|i| entry(100, 0x9000 + i * 16, 0x8000, 3)).collect();
        let summary = session.drain(&build(5, 2, &survivors)).expect("drain 2");

        assert!(summary.lost);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.new_samples, 5);
        assert_eq!(session.total_samples(), 15);
    }

    #[test]
    fn test_level_view_keys_by_latency() {
        let sink = SharedBuf::default();
        let opts = SessionOptions {
            view: ViewMode::Level,
            ..SessionOptions::default()
        };
        let mut session = text_session(opts, sink);

        let data = build(
            3,
            0,
            &[
                entry(100, 0x4010, 0x8000, 3),
                entry(100, 0x4020, 0x8020, 3),
                entry(100, 0x4030, 0x8040, 40),
            ],
        );
        session.drain(&data).expect("drain");

        // Keys are the latency values 3 and 40, not addresses.
        assert_eq!(session.distinct_values(), 2);
    }

    #[test]
    fn test_closed_session_rejects_drain_and_close() {
        let sink = SharedBuf::default();
        let mut session = text_session(SessionOptions::default(), sink);
        session.close().expect("close");

        let data = build(1, 0, &[entry(100, 0x4010, 0x8000, 3)]);
        assert!(session.drain(&data).is_err());
        assert!(session.close().is_err());
    }

    #[test]
    fn test_render_failure_keeps_session_retryable() {
        let mut session = Session::new(
            "failing",
            SessionOptions::default(),
            PmuModel::Itanium2.decoder(),
            &StaticTopology(THRESHOLDS),
            Arc::new(NoSymbols),
            SessionOutput::Text(Box::new(FailWriter)),
        )
        .expect("session");

        let data = build(1, 0, &[entry(100, 0x4010, 0x8000, 3)]);
        session.drain(&data).expect("drain");

        let err = session.close().expect_err("close must fail");
        assert!(!err.to_string().contains("already closed"));
        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(session.total_samples(), 1);
    }

    #[test]
    fn test_malformed_buffer_preserves_watermark() {
        let sink = SharedBuf::default();
        let mut session = text_session(SessionOptions::default(), sink);

        assert!(session.drain(&[0u8; 4]).is_err());
        assert_eq!(session.watermark(), Watermark::INITIAL);
    }

    #[test]
    fn test_symbol_map_change_resets_single_target_table() {
        let sink = SharedBuf::default();
        let symbols = Arc::new(ModuleMap::new());
        let mut session = Session::new(
            "target-100",
            SessionOptions::default(),
            PmuModel::Itanium2.decoder(),
            &StaticTopology(THRESHOLDS),
            Arc::clone(&symbols) as Arc<dyn SymbolResolver>,
            SessionOutput::Text(Box::new(sink)),
        )
        .expect("session");

        let e1 = entry(100, 0x4010, 0x8000, 3);
        let e2 = entry(100, 0x4010, 0x8000, 3);
        session.drain(&build(2, 0, &[e1.clone(), e2.clone()])).expect("drain 1");
        assert_eq!(session.total_samples(), 2);

        symbols.bump_version();

        let e3 = entry(100, 0x4010, 0x8000, 3);
        session.drain(&build(3, 0, &[e1, e2, e3])).expect("drain 2");

        // Pre-exec samples dropped; only the post-bump sample remains.
        assert_eq!(session.total_samples(), 1);
        assert_eq!(session.distinct_values(), 1);
    }

    #[test]
    fn test_aggregated_table_survives_version_change() {
        let sink = SharedBuf::default();
        let symbols = Arc::new(ModuleMap::new());
        let opts = SessionOptions {
            aggregate: true,
            ..SessionOptions::default()
        };
        let mut session = Session::new(
            "aggregate",
            opts,
            PmuModel::Itanium2.decoder(),
            &StaticTopology(THRESHOLDS),
            Arc::clone(&symbols) as Arc<dyn SymbolResolver>,
            SessionOutput::Text(Box::new(sink)),
        )
        .expect("session");

        let e1 = entry(100, 0x4010, 0x8000, 3);
        session.drain(&build(1, 0, &[e1.clone()])).expect("drain 1");
        symbols.bump_version();
        let e2 = entry(100, 0x4010, 0x8000, 3);
        session.drain(&build(2, 0, &[e1, e2])).expect("drain 2");

        // Both epochs retained, kept apart by the key's map version.
        assert_eq!(session.total_samples(), 2);
        assert_eq!(session.distinct_values(), 2);
    }

    #[test]
    fn test_new_rejects_incompatible_options() {
        let bad_fold = SessionOptions {
            fold_symbols: true,
            view: ViewMode::Data,
            ..SessionOptions::default()
        };
        assert!(bad_fold.validate().is_err());

        let bad_sort = SessionOptions {
            sort: SortMode::Level,
            view: ViewMode::Level,
            ..SessionOptions::default()
        };
        assert!(bad_sort.validate().is_err());

        let bad_cutoff = SessionOptions {
            cutoff_percent: 0.0,
            ..SessionOptions::default()
        };
        assert!(bad_cutoff.validate().is_err());

        let bad_binary_fold = SessionOptions {
            fold_symbols: true,
            output: OutputMode::Binary,
            ..SessionOptions::default()
        };
        assert!(bad_binary_fold.validate().is_err());
    }

    #[test]
    fn test_new_rejects_unordered_thresholds() {
        let result = Session::new(
            "bad",
            SessionOptions::default(),
            PmuModel::Itanium2.decoder(),
            &StaticTopology(LevelThresholds { l2: 14, l3: 5 }),
            Arc::new(NoSymbols),
            SessionOutput::Text(Box::new(SharedBuf::default())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_new_rejects_mismatched_sink() {
        let opts = SessionOptions {
            output: OutputMode::Binary,
            ..SessionOptions::default()
        };
        let result = Session::new(
            "bad",
            opts,
            PmuModel::Itanium2.decoder(),
            &StaticTopology(THRESHOLDS),
            Arc::new(NoSymbols),
            SessionOutput::Text(Box::new(SharedBuf::default())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_binary_session_streams_samples() {
        use crate::report::binary::SampleStreamReader;

        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let writer = SampleStreamWriter::new(
            tmp.reopen().expect("reopen for writing"),
            SamplingMode::Cache,
            ViewMode::Data,
        )
        .expect("stream writer");
        let opts = SessionOptions {
            output: OutputMode::Binary,
            view: ViewMode::Data,
            ..SessionOptions::default()
        };
        let mut session = Session::new(
            "binary",
            opts,
            PmuModel::Itanium2.decoder(),
            &StaticTopology(THRESHOLDS),
            Arc::new(NoSymbols),
            SessionOutput::Binary(writer),
        )
        .expect("session");

        let e1 = entry(100, 0x4010, 0x8000, 3);
        let e2 = entry(100, 0x4020, 0x8020, 7);
        let summary = session.drain(&build(2, 0, &[e1.clone(), e2.clone()])).expect("drain");
        assert_eq!(summary.new_samples, 2);

        // Binary mode bypasses the table but still advances the watermark.
        assert_eq!(session.total_samples(), 0);
        assert_eq!(session.watermark(), Watermark { count: 2, overflows: 0 });

        // Incremental drain only streams the new entry.
        let e3 = entry(100, 0x4030, 0x8040, 20);
        let summary = session.drain(&build(3, 0, &[e1, e2, e3])).expect("drain 2");
        assert_eq!(summary.new_samples, 1);
        assert_eq!(summary.skipped, 2);

        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);

        // Reopen and verify the back-patched stream.
        let mut reader =
            SampleStreamReader::new(tmp.reopen().expect("reopen for reading")).expect("reader");
        assert_eq!(reader.header().count, 3);
        assert_eq!(reader.header().mode, SamplingMode::Cache);

        let mut addresses = Vec::new();
        while let Some(sample) = reader.next_sample().expect("record") {
            addresses.push(sample.payload.data_address);
        }
        assert_eq!(addresses, vec![0x8000, 0x8020, 0x8040]);
    }

    #[test]
    fn test_hub_aggregated_merges_targets() {
        let sink = SharedBuf::default();
        let opts = SessionOptions {
            aggregate: true,
            ..SessionOptions::default()
        };
        let hub = SessionHub::aggregated(text_session(opts, sink.clone()));

        hub.drain(1, &build(1, 0, &[entry(100, 0x4010, 0x8000, 3)]))
            .expect("drain target 1");
        hub.drain(2, &build(1, 0, &[entry(200, 0x4010, 0x8000, 3)]))
            .expect("drain target 2");

        assert_eq!(hub.session_count(), 1);
        hub.close_all().expect("close");

        let text = sink.contents();
        assert!(text.contains("# 2 samples"), "report:\n{text}");
    }

    #[test]
    fn test_hub_per_target_isolates_sessions() {
        let sinks: Arc<Mutex<Vec<(u32, SharedBuf)>>> = Arc::new(Mutex::new(Vec::new()));
        let sinks_in_factory = Arc::clone(&sinks);

        let hub = SessionHub::per_target(move |target| {
            let sink = SharedBuf::default();
            sinks_in_factory
                .lock()
                .expect("sinks lock")
                .push((target, sink.clone()));
            Session::new(
                format!("target-{target}"),
                SessionOptions::default(),
                PmuModel::Itanium2.decoder(),
                &StaticTopology(THRESHOLDS),
                Arc::new(NoSymbols),
                SessionOutput::Text(Box::new(sink)),
            )
        });

        hub.drain(7, &build(1, 0, &[entry(7, 0x4010, 0x8000, 3)]))
            .expect("drain 7");
        hub.drain(9, &build(1, 0, &[entry(9, 0x4010, 0x8000, 3)]))
            .expect("drain 9");
        hub.drain(7, &build(2, 0, &[entry(7, 0x4010, 0x8000, 3), entry(7, 0x4020, 0x8020, 3)]))
            .expect("drain 7 again");

        assert_eq!(hub.session_count(), 2);
        hub.close_all().expect("close all");

        let sinks = sinks.lock().expect("sinks lock");
        for (target, sink) in sinks.iter() {
            let text = sink.contents();
            match target {
                7 => assert!(text.contains("# 2 samples"), "target 7 report:\n{text}"),
                9 => assert!(text.contains("# 1 samples"), "target 9 report:\n{text}"),
                _ => panic!("unexpected target {target}"),
            }
        }
    }

    #[test]
    fn test_hub_close_all_reports_first_error() {
        let hub = SessionHub::per_target(|target| {
            Session::new(
                format!("target-{target}"),
                SessionOptions::default(),
                PmuModel::Itanium2.decoder(),
                &StaticTopology(THRESHOLDS),
                Arc::new(NoSymbols),
                SessionOutput::Text(Box::new(FailWriter)),
            )
        });

        hub.drain(1, &build(1, 0, &[entry(1, 0x4010, 0x8000, 3)]))
            .expect("drain");
        assert!(hub.close_all().is_err());
    }
}
