//! CPU event handler
//!
//! Processes host-side enter/exit notifications for intercepted API calls, on
//! the caller's thread.
//!
//! ```text
//! Enter: push identity on thread stack → register cid → begin marker
//!        → critical Begin → flush deferred work for this thread
//! Exit:  flush deferred work → close cid → pop stack → end marker
//!        → critical End → record_duration
//! ```
//!
//! Calls in the untracked domain (no correlation id) keep only a begin
//! timestamp on the thread and emit one leaf span at exit.

use crate::correlation::CorrelationRegistry;
use crate::critical_trace::CriticalEntry;
use crate::dispatcher::DeferredDispatcher;
use crate::operation_filter::OperationFilter;
use crate::sink::{SinkSet, SpanBegin, Track};
use crate::span_id::{CorrelationId, SpanIdAllocator, SpanIdentity};
use crate::span_record::SpanKind;
use crate::thread_context::ThreadContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime shutdown call; its exit timestamp is not trustworthy
const SHUTDOWN_OPERATION: &str = "hsa_shut_down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiDomain {
    /// Calls that carry a correlation id
    #[default]
    Correlated,
    /// Calls with no correlation id and no device activity of their own
    Untracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Enter,
    Exit,
}

/// Decoded argument blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallArgs {
    /// Kernel launched by a launch call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
    /// Queue/stream handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<u64>,
}

/// One CPU callback payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuEvent {
    #[serde(default)]
    pub operation_id: u32,
    pub name: String,
    pub phase: CallPhase,
    #[serde(default)]
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub args: CallArgs,
    #[serde(default)]
    pub domain: ApiDomain,
}

impl CpuEvent {
    pub fn enter(name: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            operation_id: 0,
            name: name.into(),
            phase: CallPhase::Enter,
            correlation_id,
            args: CallArgs::default(),
            domain: ApiDomain::Correlated,
        }
    }

    pub fn exit(name: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            phase: CallPhase::Exit,
            ..Self::enter(name, correlation_id)
        }
    }

    pub fn with_kernel(mut self, kernel_name: impl Into<String>) -> Self {
        self.args.kernel_name = Some(kernel_name.into());
        self
    }

    pub fn with_queue(mut self, queue: u64) -> Self {
        self.args.queue = Some(queue);
        self
    }

    pub fn untracked(mut self) -> Self {
        self.domain = ApiDomain::Untracked;
        self
    }

    /// Name registered for device records of this call
    pub fn display_name(&self) -> &str {
        self.args.kernel_name.as_deref().unwrap_or(&self.name)
    }
}

/// What the handler did with one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOutcome {
    /// Rejected by the operation filter
    Filtered,
    Entered(SpanIdentity),
    Exited(SpanIdentity),
    /// Exit with no open correlation record; emitted best effort
    MissingRecord,
    /// End before begin; span dropped
    ClockAnomaly,
    /// Untracked call emitted as a leaf span at exit
    Untracked(SpanIdentity),
    /// Untracked exit with no recorded begin
    Ignored,
}

/// Handler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuHandlerStats {
    pub enters: u64,
    pub exits: u64,
    pub filtered: u64,
    pub missing_records: u64,
    pub clock_anomalies: u64,
    pub untracked_spans: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enters: AtomicU64,
    exits: AtomicU64,
    filtered: AtomicU64,
    missing_records: AtomicU64,
    clock_anomalies: AtomicU64,
    untracked_spans: AtomicU64,
}

/// Host-side callback processing
#[derive(Debug)]
pub struct CpuEventHandler {
    registry: Arc<CorrelationRegistry>,
    dispatcher: Arc<DeferredDispatcher>,
    span_ids: Arc<SpanIdAllocator>,
    sinks: SinkSet,
    filter: OperationFilter,
    counters: Counters,
}

impl CpuEventHandler {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        dispatcher: Arc<DeferredDispatcher>,
        span_ids: Arc<SpanIdAllocator>,
        sinks: SinkSet,
        filter: OperationFilter,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            span_ids,
            sinks,
            filter,
            counters: Counters::default(),
        }
    }

    /// Process one event on the calling thread at host time `now_ns`
    pub fn handle(&self, ctx: &mut ThreadContext, event: &CpuEvent, now_ns: u64) -> CpuOutcome {
        tracing::trace!(
            op = %event.name,
            id = event.operation_id,
            cid = event.correlation_id,
            phase = ?event.phase,
            ts = now_ns,
            "cpu callback"
        );

        if !self.filter.should_trace(&event.name) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return CpuOutcome::Filtered;
        }

        match (event.domain, event.phase) {
            (ApiDomain::Correlated, CallPhase::Enter) => self.on_enter(ctx, event, now_ns),
            (ApiDomain::Correlated, CallPhase::Exit) => self.on_exit(ctx, event, now_ns),
            (ApiDomain::Untracked, CallPhase::Enter) => {
                ctx.push_untracked(now_ns);
                CpuOutcome::Ignored
            }
            (ApiDomain::Untracked, CallPhase::Exit) => self.on_untracked_exit(ctx, event, now_ns),
        }
    }

    fn on_enter(&self, ctx: &mut ThreadContext, event: &CpuEvent, now_ns: u64) -> CpuOutcome {
        self.counters.enters.fetch_add(1, Ordering::Relaxed);
        let thread_id = ctx.thread_id();
        let cid = event.correlation_id;
        let identity = ctx.push_call(&self.span_ids, now_ns);

        self.registry
            .register(cid, event.display_name(), thread_id, identity);

        let mut attributes = BTreeMap::new();
        attributes.insert("corr_id".to_string(), cid.to_string());
        attributes.insert("tid".to_string(), thread_id.to_string());
        attributes.insert("depth".to_string(), identity.depth.to_string());
        if let Some(parent) = identity.parent_span_id {
            attributes.insert("pcid".to_string(), parent.to_string());
        }
        if let Some(kernel) = &event.args.kernel_name {
            attributes.insert("kernel".to_string(), kernel.clone());
        }
        if let Some(queue) = event.args.queue {
            attributes.insert("queue".to_string(), queue.to_string());
        }

        self.sinks.begin_span(SpanBegin {
            name: event.name.clone(),
            kind: SpanKind::Cpu,
            track: Track::Thread(thread_id),
            timestamp_ns: now_ns,
            identity,
            thread_id,
            correlation_id: Some(cid),
            lap: None,
            attributes,
        });
        self.sinks.critical(
            &event.name,
            CriticalEntry::cpu_begin(
                &event.name,
                thread_id,
                identity,
                Some(cid),
                now_ns,
                event.args.queue,
            ),
        );

        self.dispatcher.flush(thread_id);
        CpuOutcome::Entered(identity)
    }

    fn on_exit(&self, ctx: &mut ThreadContext, event: &CpuEvent, now_ns: u64) -> CpuOutcome {
        self.counters.exits.fetch_add(1, Ordering::Relaxed);
        let thread_id = ctx.thread_id();
        let track = Track::Thread(thread_id);

        // device work queued since enter lands before this call closes
        self.dispatcher.flush(thread_id);

        let identity = self.registry.close(event.correlation_id);
        let depth = ctx.depth();
        let matched = if identity.is_degraded() {
            None
        } else {
            ctx.pop_call(identity.span_id)
        };
        let Some(open) = matched else {
            // id reused on this thread or overwritten from another one: the
            // thread's own stack decides which call this exit closes
            self.counters.missing_records.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                op = %event.name,
                cid = event.correlation_id,
                depth,
                "exit without matching correlation record"
            );
            if let Some(open) = ctx.pop_top() {
                if now_ns < open.begin_ns {
                    self.sinks.discard_span(track);
                } else {
                    self.sinks.end_span(track, now_ns);
                }
            }
            return CpuOutcome::MissingRecord;
        };
        // calls above the match never saw their exit
        for _ in ctx.depth() + 1..depth {
            self.sinks.discard_span(track);
        }

        if now_ns < open.begin_ns {
            self.counters.clock_anomalies.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                op = %event.name,
                begin = open.begin_ns,
                end = now_ns,
                "cpu span ends before it begins; dropped"
            );
            self.sinks.discard_span(track);
            return CpuOutcome::ClockAnomaly;
        }

        self.sinks.end_span(track, now_ns);
        self.sinks.critical(
            &event.name,
            CriticalEntry::cpu_end(&event.name, thread_id, identity, now_ns),
        );
        self.sinks
            .record_duration(&event.name, now_ns - open.begin_ns);

        CpuOutcome::Exited(identity)
    }

    fn on_untracked_exit(
        &self,
        ctx: &mut ThreadContext,
        event: &CpuEvent,
        now_ns: u64,
    ) -> CpuOutcome {
        let Some(begin_ns) = ctx.pop_untracked() else {
            return CpuOutcome::Ignored;
        };
        let end_ns = if event.name == SHUTDOWN_OPERATION {
            begin_ns
        } else {
            now_ns
        };
        if begin_ns > end_ns {
            self.counters.clock_anomalies.fetch_add(1, Ordering::Relaxed);
            return CpuOutcome::ClockAnomaly;
        }

        let thread_id = ctx.thread_id();
        let identity = ctx.next_identity(&self.span_ids);
        let track = Track::Thread(thread_id);
        self.sinks.begin_span(SpanBegin {
            name: event.name.clone(),
            kind: SpanKind::Cpu,
            track,
            timestamp_ns: begin_ns,
            identity,
            thread_id,
            correlation_id: None,
            lap: None,
            attributes: BTreeMap::new(),
        });
        self.sinks.end_span(track, end_ns);

        if let Some(durations) = self.sinks.durations.clone() {
            let name = event.name.clone();
            let scope = self.sinks.scope;
            self.dispatcher.spawn(move || {
                durations.record_duration(&name, end_ns - begin_ns, scope)
            });
        }

        self.counters.untracked_spans.fetch_add(1, Ordering::Relaxed);
        CpuOutcome::Untracked(identity)
    }

    pub fn stats(&self) -> CpuHandlerStats {
        CpuHandlerStats {
            enters: self.counters.enters.load(Ordering::Relaxed),
            exits: self.counters.exits.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            missing_records: self.counters.missing_records.load(Ordering::Relaxed),
            clock_anomalies: self.counters.clock_anomalies.load(Ordering::Relaxed),
            untracked_spans: self.counters.untracked_spans.load(Ordering::Relaxed),
        }
    }
}
