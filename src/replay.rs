//! Replay of recorded callback streams
//!
//! A replay file is JSON lines, one [`ReplayEvent`] per line. Blank lines and
//! lines starting with `#` are ignored.
//!
//! ```text
//! {"type":"cpu","thread":7,"ts":100,"event":{"name":"hipLaunchKernel","phase":"enter","correlation_id":42,"args":{"kernel_name":"vector_add"}}}
//! {"type":"device","thread":100,"records":[{"correlation_id":42,"op":0,"begin_ns":50,"end_ns":80}]}
//! {"type":"cpu","thread":7,"ts":200,"event":{"name":"hipLaunchKernel","phase":"exit","correlation_id":42}}
//! ```
//!
//! Events drive a [`TraceSession`] over a [`FakeTraceSource`]; each `thread`
//! value gets its own thread context so the recorded thread ids survive.

use crate::aggregator::DurationAggregator;
use crate::clock_skew::ClockSkew;
use crate::config::TraceConfig;
use crate::cpu_handler::CpuEvent;
use crate::critical_path::{find_critical_path, CriticalPathResult};
use crate::critical_trace::ForestViolation;
use crate::device_drainer::{DeviceRecord, DrainReport};
use crate::error::{TraceError, TraceResult};
use crate::recorder::TraceRecorder;
use crate::session::{SessionStats, ShutdownReport, TraceSession};
use crate::sink::{FanoutSink, SpanSink};
use crate::span_record::{SpanKind, SpanRecord};
use crate::thread_context::ThreadContext;
use crate::trace_source::FakeTraceSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;

/// One recorded callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    /// CPU enter/exit at host time `ts`
    Cpu {
        thread: u64,
        ts: u64,
        event: CpuEvent,
    },
    /// Correlated device activity batch drained on `thread`
    Device {
        thread: u64,
        records: Vec<DeviceRecord>,
    },
    /// Device activity with no CPU call
    Untracked {
        thread: u64,
        records: Vec<DeviceRecord>,
    },
}

impl ReplayEvent {
    pub fn thread(&self) -> u64 {
        match self {
            ReplayEvent::Cpu { thread, .. }
            | ReplayEvent::Device { thread, .. }
            | ReplayEvent::Untracked { thread, .. } => *thread,
        }
    }
}

/// Decode a JSON-lines stream
///
/// # Errors
///
/// [`TraceError::ReplayDecode`] with the 1-based line number, or an I/O error.
pub fn parse_events<R: BufRead>(reader: R) -> TraceResult<Vec<ReplayEvent>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|e| TraceError::ReplayDecode {
            line: index + 1,
            reason: e.to_string(),
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Result of a finished replay
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Finished spans ordered by begin time
    pub spans: Vec<SpanRecord>,
    pub aggregator: Arc<DurationAggregator>,
    pub critical_path: Option<CriticalPathResult>,
    pub violations: Vec<ForestViolation>,
    pub drains: DrainReport,
    pub stats: SessionStats,
    pub shutdown: ShutdownReport,
}

/// Drives a session from recorded events
pub struct Replayer {
    session: TraceSession,
    recorder: Arc<TraceRecorder>,
    aggregator: Arc<DurationAggregator>,
    contexts: HashMap<u64, ThreadContext>,
    drains: DrainReport,
}

impl Replayer {
    /// Start a session for replay
    ///
    /// `skew_offset` fixes the device-to-host offset; without it the offset is
    /// 0, since recorded timestamps cannot be recalibrated. `extra` receives
    /// spans alongside the in-memory recorder.
    pub fn new(
        config: TraceConfig,
        skew_offset: Option<i64>,
        extra: Option<Arc<dyn SpanSink>>,
    ) -> TraceResult<Self> {
        let recorder = Arc::new(TraceRecorder::new());
        let aggregator = Arc::new(DurationAggregator::new());
        let offset = if config.use_clock_skew {
            skew_offset.unwrap_or(0)
        } else {
            0
        };

        let spans: Arc<dyn SpanSink> = match extra {
            Some(extra) => Arc::new(FanoutSink::new().with(recorder.clone()).with(extra)),
            None => recorder.clone(),
        };
        let session = TraceSession::builder(config, Arc::new(FakeTraceSource::new()))
            .span_sink(spans)
            .duration_sink(aggregator.clone())
            .clock_skew(ClockSkew::fixed(offset))
            .build()?;
        session.start()?;

        Ok(Self {
            session,
            recorder,
            aggregator,
            contexts: HashMap::new(),
            drains: DrainReport::default(),
        })
    }

    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    pub fn apply(&mut self, event: &ReplayEvent) {
        let thread = event.thread();
        let session = &self.session;
        let ctx = self
            .contexts
            .entry(thread)
            .or_insert_with(|| session.thread_context(thread));

        match event {
            ReplayEvent::Cpu { ts, event, .. } => {
                let outcome = session.on_cpu_event_in(ctx, event, *ts);
                tracing::trace!(thread, ?outcome, "replayed cpu event");
            }
            ReplayEvent::Device { records, .. } => {
                let report = session.on_device_batch_in(ctx, records);
                self.drains.merge(&report);
            }
            ReplayEvent::Untracked { records, .. } => {
                let report = session.on_untracked_activity_in(ctx, records);
                self.drains.merge(&report);
            }
        }
    }

    /// Shut the session down and collect results
    pub fn finish(self) -> anyhow::Result<ReplayOutcome> {
        let shutdown = self.session.shutdown()?;
        let stats = self.session.stats();

        let (critical_path, violations) = match self.session.critical_trace() {
            Some(trace) => {
                let forest = trace.assemble();
                for violation in &forest.violations {
                    tracing::warn!(?violation, "span forest violation");
                }
                (Some(find_critical_path(&forest)?), forest.violations.clone())
            }
            None => (None, Vec::new()),
        };

        let mut spans = self.recorder.take();
        spans.sort_by_key(|s| (s.begin_ns, s.depth));

        Ok(ReplayOutcome {
            spans,
            aggregator: self.aggregator,
            critical_path,
            violations,
            drains: self.drains,
            stats,
            shutdown,
        })
    }
}

/// Replay a whole event list
pub fn replay(
    config: TraceConfig,
    events: &[ReplayEvent],
    skew_offset: Option<i64>,
) -> anyhow::Result<ReplayOutcome> {
    let mut replayer = Replayer::new(config, skew_offset, None)?;
    for event in events {
        replayer.apply(event);
    }
    replayer.finish()
}

/// One-line text rendering of a span
pub fn format_span(span: &SpanRecord) -> String {
    let kind = match span.kind {
        SpanKind::Cpu => "cpu",
        SpanKind::Device => "dev",
    };
    let parent = span
        .parent_span_id
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "[{}] {:indent$}{} {}..{} ({} ns) span={} parent={} depth={} thread={}",
        kind,
        "",
        span.name,
        span.begin_ns,
        span.end_ns,
        span.duration_ns,
        span.span_id,
        parent,
        span.depth,
        span.thread_id,
        indent = span.depth as usize * 2
    );
    if let Some(lap) = span.lap {
        line.push_str(&format!(" lap={}", lap));
    }
    if let Some(cid) = span.correlation_id {
        line.push_str(&format!(" cid={}", cid));
    }
    line
}
