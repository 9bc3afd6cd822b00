//! Device event drainer
//!
//! Consumes batches of completed device operations, correlates each back to the
//! CPU call that launched it and emits a device span one level below that call.
//!
//! ```text
//! for each record (cursor always advances):
//!   kind filter → skew → lap ordinal → registry lookup
//!     found:     parent = CPU span, depth + 1, owner thread
//!     not found: orphan, depth 0
//!   visualization: now, on the draining thread
//!   aggregation:   deferred to the owner thread's queue
//! ```
//!
//! Records are never held back waiting for a CPU registration that has not
//! happened yet; a late or missing registration produces an orphan.

use crate::clock_skew::{ClockSkew, HostClock};
use crate::correlation::{CorrelationRecord, CorrelationRegistry};
use crate::critical_trace::CriticalEntry;
use crate::dispatcher::DeferredDispatcher;
use crate::operation_filter::OperationFilter;
use crate::sink::{SinkSet, SpanBegin, Track};
use crate::span_id::{CorrelationId, SpanIdentity};
use crate::span_record::SpanKind;
use crate::thread_context::ThreadContext;
use crate::trace_source::{DeviceClock, TraceSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Activity domain a record was reported under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityDomain {
    /// Dispatch, copy and barrier operations
    #[default]
    DeviceOps,
    /// Anything else the runtime delivers on the same buffer
    Other,
}

/// Supported device operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    Dispatch,
    Copy,
    Barrier,
}

impl OpKind {
    /// Decode the runtime's numeric op; `None` for unsupported kinds
    pub fn from_raw(op: u32) -> Option<Self> {
        match op {
            0 => Some(OpKind::Dispatch),
            1 => Some(OpKind::Copy),
            2 => Some(OpKind::Barrier),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Dispatch => "DISPATCH",
            OpKind::Copy => "COPY",
            OpKind::Barrier => "BARRIER",
        }
    }

    /// Span name for activity with no correlated CPU call
    pub fn untracked_name(self) -> &'static str {
        match self {
            OpKind::Dispatch => "hsa_dispatch",
            OpKind::Copy => "hsa_async_copy",
            OpKind::Barrier => "hsa_barrier",
        }
    }
}

/// One completed device operation, timestamps on the device clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub domain: ActivityDomain,
    /// Raw op kind; see [`OpKind::from_raw`]
    pub op: u32,
    /// Name reported by the runtime, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_name: Option<String>,
    pub begin_ns: u64,
    pub end_ns: u64,
    #[serde(default)]
    pub device_id: u32,
    #[serde(default)]
    pub queue_id: u64,
}

impl DeviceRecord {
    pub fn new(correlation_id: CorrelationId, kind: OpKind, begin_ns: u64, end_ns: u64) -> Self {
        Self {
            correlation_id,
            domain: ActivityDomain::DeviceOps,
            op: kind as u32,
            op_name: None,
            begin_ns,
            end_ns,
            device_id: 0,
            queue_id: 0,
        }
    }

    pub fn on_queue(mut self, device_id: u32, queue_id: u64) -> Self {
        self.device_id = device_id;
        self.queue_id = queue_id;
        self
    }

    pub fn with_op_name(mut self, name: impl Into<String>) -> Self {
        self.op_name = Some(name.into());
        self
    }

    pub fn kind(&self) -> Option<OpKind> {
        match self.domain {
            ActivityDomain::DeviceOps => OpKind::from_raw(self.op),
            ActivityDomain::Other => None,
        }
    }
}

/// Position in a record batch
///
/// Only [`Step`] moves the cursor, and it does so when dropped, so every exit
/// path out of a record's processing advances exactly once.
#[derive(Debug)]
pub struct RecordCursor<'a> {
    records: &'a [DeviceRecord],
    position: usize,
    steps: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(records: &'a [DeviceRecord]) -> Self {
        Self {
            records,
            position: 0,
            steps: 0,
        }
    }

    pub fn current(&self) -> Option<&'a DeviceRecord> {
        self.records.get(self.position)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.records.len()
    }

    /// Guard that advances the cursor when dropped
    pub fn step(&mut self) -> Step<'_, 'a> {
        Step(self)
    }
}

pub struct Step<'c, 'a>(&'c mut RecordCursor<'a>);

impl Drop for Step<'_, '_> {
    fn drop(&mut self) {
        self.0.position += 1;
        self.0.steps += 1;
    }
}

/// Per-batch outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Cursor steps taken; always equals the batch length
    pub advanced: usize,
    pub emitted: usize,
    pub skipped_unsupported: usize,
    /// Supported kinds excluded by the activity filter
    pub filtered: usize,
    /// End not after begin
    pub dropped_anomalies: usize,
    /// Emitted without a registered CPU call
    pub orphans: usize,
}

impl DrainReport {
    pub fn merge(&mut self, other: &DrainReport) {
        self.advanced += other.advanced;
        self.emitted += other.emitted;
        self.skipped_unsupported += other.skipped_unsupported;
        self.filtered += other.filtered;
        self.dropped_anomalies += other.dropped_anomalies;
        self.orphans += other.orphans;
    }
}

/// Drainer statistics over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainerStats {
    pub batches: u64,
    pub records: u64,
    pub emitted: u64,
    pub orphans: u64,
    pub untracked: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    records: AtomicU64,
    emitted: AtomicU64,
    orphans: AtomicU64,
    untracked: AtomicU64,
}

enum Disposition {
    Emitted { orphan: bool },
    Unsupported,
    Filtered,
    Anomaly,
}

/// Device-side batch processing
pub struct DeviceDrainer {
    registry: Arc<CorrelationRegistry>,
    dispatcher: Arc<DeferredDispatcher>,
    skew: Arc<ClockSkew>,
    source: Arc<dyn TraceSource>,
    sinks: SinkSet,
    filter: OperationFilter,
    block_signals: bool,
    counters: Counters,
}

impl DeviceDrainer {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        dispatcher: Arc<DeferredDispatcher>,
        skew: Arc<ClockSkew>,
        source: Arc<dyn TraceSource>,
        sinks: SinkSet,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            skew,
            source,
            sinks,
            filter: OperationFilter::all(),
            block_signals: false,
            counters: Counters::default(),
        }
    }

    /// Restrict which op kinds (`DISPATCH`, `COPY`, `BARRIER`) are emitted
    pub fn with_filter(mut self, filter: OperationFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Block profiler signals on a draining thread before its first batch
    pub fn with_signal_blocking(mut self, block: bool) -> Self {
        self.block_signals = block;
        self
    }

    /// Drain one batch of correlated activity on the calling thread
    pub fn drain(&self, ctx: &mut ThreadContext, records: &[DeviceRecord]) -> DrainReport {
        self.prepare_thread(ctx);
        let offset = self.offset();
        let mut report = DrainReport::default();
        let mut cursor = RecordCursor::new(records);

        while let Some(record) = cursor.current() {
            let _step = cursor.step();
            match self.process(ctx, record, offset) {
                Disposition::Emitted { orphan } => {
                    report.emitted += 1;
                    if orphan {
                        report.orphans += 1;
                    }
                }
                Disposition::Unsupported => report.skipped_unsupported += 1,
                Disposition::Filtered => report.filtered += 1,
                Disposition::Anomaly => report.dropped_anomalies += 1,
            }
        }
        report.advanced = cursor.steps();

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .records
            .fetch_add(report.advanced as u64, Ordering::Relaxed);
        self.counters
            .emitted
            .fetch_add(report.emitted as u64, Ordering::Relaxed);
        self.counters
            .orphans
            .fetch_add(report.orphans as u64, Ordering::Relaxed);

        tracing::debug!(
            records = records.len(),
            emitted = report.emitted,
            orphans = report.orphans,
            skipped = report.skipped_unsupported,
            anomalies = report.dropped_anomalies,
            "device batch drained"
        );
        report
    }

    fn process(&self, ctx: &mut ThreadContext, record: &DeviceRecord, offset: i64) -> Disposition {
        let Some(kind) = record.kind() else {
            tracing::trace!(
                cid = record.correlation_id,
                op = record.op,
                domain = ?record.domain,
                "unsupported device record skipped"
            );
            return Disposition::Unsupported;
        };
        if !self.filter.should_trace(kind.name()) {
            return Disposition::Filtered;
        }

        let begin_ns = crate::clock_skew::apply_skew(record.begin_ns, offset);
        let end_ns = crate::clock_skew::apply_skew(record.end_ns, offset);
        let cid = record.correlation_id;
        let lap = ctx.laps_mut().next(cid);

        let found = self.registry.lookup_record(cid);
        if end_ns <= begin_ns {
            tracing::debug!(cid, begin = begin_ns, end = end_ns, "device record dropped: clock anomaly");
            return Disposition::Anomaly;
        }

        let name = resolve_name(found.as_ref(), record, kind);
        let (identity, thread_id) = match &found {
            Some(cpu) => (
                SpanIdentity::child_of(cpu.span_identity.span_id, &cpu.span_identity),
                cpu.owning_thread_id,
            ),
            None => (SpanIdentity::degraded(), ctx.thread_id()),
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("corr_id".to_string(), cid.to_string());
        attributes.insert("device".to_string(), record.device_id.to_string());
        attributes.insert("queue".to_string(), record.queue_id.to_string());
        attributes.insert("op".to_string(), kind.name().to_string());

        self.sinks.complete_span(
            SpanBegin {
                name: name.clone(),
                kind: SpanKind::Device,
                track: Track::Device {
                    device_id: record.device_id,
                    queue_id: record.queue_id,
                },
                timestamp_ns: begin_ns,
                identity,
                thread_id,
                correlation_id: Some(cid),
                lap: Some(lap),
                attributes,
            },
            end_ns,
        );

        let Some(cpu) = found else {
            tracing::trace!(cid, lap, "orphan device span");
            return Disposition::Emitted { orphan: true };
        };

        self.sinks.critical(
            &name,
            CriticalEntry::gpu_delta(
                &name,
                cpu.owning_thread_id,
                cpu.span_identity,
                cid,
                begin_ns,
                end_ns,
                record.queue_id,
                lap,
            ),
        );
        if let Some(durations) = self.sinks.durations.clone() {
            let scope = self.sinks.scope;
            let duration = end_ns - begin_ns;
            self.dispatcher.submit(cpu.owning_thread_id, move || {
                durations.record_duration(&name, duration, scope)
            });
        }

        Disposition::Emitted { orphan: false }
    }

    /// Drain activity that has no CPU call behind it
    ///
    /// Emission runs entirely on the dispatcher since there is no owning
    /// thread to attribute it to.
    pub fn drain_untracked(&self, ctx: &mut ThreadContext, records: &[DeviceRecord]) -> DrainReport {
        self.prepare_thread(ctx);
        let offset = self.offset();
        let thread_id = ctx.thread_id();
        let mut report = DrainReport::default();
        let mut cursor = RecordCursor::new(records);

        while let Some(record) = cursor.current() {
            let _step = cursor.step();
            let Some(kind) = record.kind() else {
                report.skipped_unsupported += 1;
                continue;
            };
            if !self.filter.should_trace(kind.name()) {
                report.filtered += 1;
                continue;
            }
            let begin_ns = crate::clock_skew::apply_skew(record.begin_ns, offset);
            let end_ns = crate::clock_skew::apply_skew(record.end_ns, offset);
            if end_ns <= begin_ns {
                report.dropped_anomalies += 1;
                continue;
            }

            let sinks = self.sinks.clone();
            let device_id = record.device_id;
            let queue_id = record.queue_id;
            self.dispatcher.spawn(move || {
                let name = kind.untracked_name();
                let mut attributes = BTreeMap::new();
                attributes.insert("device".to_string(), device_id.to_string());
                attributes.insert("queue".to_string(), queue_id.to_string());
                attributes.insert("op".to_string(), kind.name().to_string());
                sinks.complete_span(
                    SpanBegin {
                        name: name.to_string(),
                        kind: SpanKind::Device,
                        track: Track::Device {
                            device_id,
                            queue_id,
                        },
                        timestamp_ns: begin_ns,
                        identity: SpanIdentity::degraded(),
                        thread_id,
                        correlation_id: None,
                        lap: None,
                        attributes,
                    },
                    end_ns,
                );
                sinks.record_duration(name, end_ns - begin_ns);
            });
            report.emitted += 1;
        }
        report.advanced = cursor.steps();

        self.counters
            .untracked
            .fetch_add(report.emitted as u64, Ordering::Relaxed);
        report
    }

    pub fn stats(&self) -> DrainerStats {
        DrainerStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            records: self.counters.records.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            orphans: self.counters.orphans.load(Ordering::Relaxed),
            untracked: self.counters.untracked.load(Ordering::Relaxed),
        }
    }

    fn offset(&self) -> i64 {
        self.skew
            .offset(&HostClock, &DeviceClock(self.source.as_ref()))
    }

    fn prepare_thread(&self, ctx: &mut ThreadContext) {
        if self.block_signals && ctx.mark_signals_blocked() {
            block_profiler_signals();
        }
    }
}

impl std::fmt::Debug for DeviceDrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDrainer")
            .field("source", &self.source.name())
            .field("sinks", &self.sinks)
            .field("block_signals", &self.block_signals)
            .finish()
    }
}

/// Registered kernel name, then the runtime's op name, then the kind
fn resolve_name(found: Option<&CorrelationRecord>, record: &DeviceRecord, kind: OpKind) -> String {
    found
        .map(|cpu| cpu.display_name.clone())
        .filter(|name| !name.is_empty())
        .or_else(|| record.op_name.clone())
        .unwrap_or_else(|| kind.name().to_string())
}

/// Keep sampling profilers from interrupting a runtime-owned drain thread
#[cfg(unix)]
fn block_profiler_signals() {
    use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGPROF);
    set.add(Signal::SIGALRM);
    match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        Ok(()) => tracing::debug!("SIGPROF/SIGALRM blocked on drain thread"),
        Err(err) => tracing::warn!("failed to block profiler signals: {}", err),
    }
}

#[cfg(not(unix))]
fn block_profiler_signals() {}
