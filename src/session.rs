//! Trace session
//!
//! The explicitly constructed correlation context. A session owns everything
//! the handlers share (registry, dispatcher, span id allocator, clock skew,
//! sinks) and ties their lifetime to `Inactive → Active → Finalized`.
//!
//! Several sessions can coexist in one process; per-thread state is keyed by
//! session id.
//!
//! # Example
//!
//! ```
//! use hetrace::config::TraceConfig;
//! use hetrace::cpu_handler::CpuEvent;
//! use hetrace::recorder::TraceRecorder;
//! use hetrace::session::TraceSession;
//! use hetrace::trace_source::FakeTraceSource;
//! use std::sync::Arc;
//!
//! let recorder = Arc::new(TraceRecorder::new());
//! let session = TraceSession::builder(TraceConfig::default(), Arc::new(FakeTraceSource::new()))
//!     .span_sink(recorder.clone())
//!     .build()
//!     .unwrap();
//!
//! session.start().unwrap();
//! session.on_cpu_event(&CpuEvent::enter("hipMalloc", 1), 100);
//! session.on_cpu_event(&CpuEvent::exit("hipMalloc", 1), 250);
//! session.shutdown().unwrap();
//!
//! assert_eq!(recorder.records()[0].duration_ns, 150);
//! ```

use crate::clock_skew::ClockSkew;
use crate::config::TraceConfig;
use crate::correlation::{CorrelationRegistry, RegistryStats};
use crate::cpu_handler::{CpuEvent, CpuEventHandler, CpuHandlerStats, CpuOutcome};
use crate::critical_trace::CriticalTrace;
use crate::device_drainer::{DeviceDrainer, DeviceRecord, DrainReport, DrainerStats};
use crate::dispatcher::{DeferredDispatcher, DispatcherStats};
use crate::error::{TraceError, TraceResult};
use crate::operation_filter::OperationFilter;
use crate::sink::{DurationSink, SinkSet, SpanSink};
use crate::span_id::SpanIdAllocator;
use crate::thread_context::{release_thread_context, with_thread_context, ThreadContext, ThreadIndex};
use crate::trace_source::{TraceDomain, TraceSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Active,
    Finalized,
}

/// A named setup or shutdown step
pub type Routine = Box<dyn FnOnce() -> TraceResult<()> + Send>;

/// What `shutdown` cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Open correlation records force-drained and discarded
    pub discarded_records: usize,
    /// Deferred jobs executed while stopping the dispatcher
    pub flushed_jobs: u64,
    /// Domains that failed to disable
    pub disable_failures: usize,
}

/// Snapshot of session counters
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub state: SessionState,
    pub registry: RegistryStats,
    pub open_records: usize,
    pub dispatcher: DispatcherStats,
    pub cpu: CpuHandlerStats,
    pub drainer: DrainerStats,
    pub threads: u64,
    pub span_ids: u64,
    /// `None` until the first device batch calibrates the skew
    pub skew_offset: Option<i64>,
}

/// Builder for [`TraceSession`]
pub struct TraceSessionBuilder {
    config: TraceConfig,
    source: Arc<dyn TraceSource>,
    spans: Option<Arc<dyn SpanSink>>,
    durations: Option<Arc<dyn DurationSink>>,
    skew: Option<ClockSkew>,
}

impl TraceSessionBuilder {
    pub fn span_sink(mut self, sink: Arc<dyn SpanSink>) -> Self {
        self.spans = Some(sink);
        self
    }

    pub fn duration_sink(mut self, sink: Arc<dyn DurationSink>) -> Self {
        self.durations = Some(sink);
        self
    }

    /// Use a prepared estimator instead of one built from the config
    pub fn clock_skew(mut self, skew: ClockSkew) -> Self {
        self.skew = Some(skew);
        self
    }

    /// # Errors
    ///
    /// Invalid filter expressions, or a worker thread that cannot be spawned.
    pub fn build(self) -> TraceResult<TraceSession> {
        let config = self.config;
        let api_filter = build_api_filter(&config)?;
        let activity_filter = match &config.activity_filter {
            Some(expr) => OperationFilter::from_expr(expr)?,
            None => OperationFilter::all(),
        };

        let critical = config
            .use_critical_trace
            .then(|| Arc::new(CriticalTrace::new()));
        let sinks = SinkSet {
            spans: self.spans.filter(|_| config.use_visualization),
            durations: self.durations.filter(|_| config.use_aggregation),
            critical: critical.clone(),
            scope: config.scope_flags(),
        };

        let registry = Arc::new(CorrelationRegistry::new());
        let dispatcher = Arc::new(DeferredDispatcher::new(
            config.worker_threads,
            config.queue_warn_threshold,
        )?);
        let span_ids = Arc::new(SpanIdAllocator::new());
        let skew = Arc::new(
            self.skew
                .unwrap_or_else(|| ClockSkew::new(config.skew_iterations, config.use_clock_skew)),
        );

        let cpu = CpuEventHandler::new(
            registry.clone(),
            dispatcher.clone(),
            span_ids.clone(),
            sinks.clone(),
            api_filter.clone(),
        );
        let drainer = DeviceDrainer::new(
            registry.clone(),
            dispatcher.clone(),
            skew.clone(),
            self.source.clone(),
            sinks,
        )
        .with_filter(activity_filter.clone())
        .with_signal_blocking(config.block_signals_on_drain);

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, workers = config.worker_threads, "trace session created");

        Ok(TraceSession {
            id,
            config,
            state: Mutex::new(SessionState::Inactive),
            source: self.source,
            registry,
            dispatcher,
            span_ids,
            skew,
            threads: ThreadIndex::new(),
            cpu,
            drainer,
            critical,
            api_filter,
            activity_filter,
            setup: Mutex::new(Vec::new()),
            teardown: Mutex::new(Vec::new()),
        })
    }
}

fn build_api_filter(config: &TraceConfig) -> TraceResult<OperationFilter> {
    let user = match &config.api_filter {
        Some(expr) => Some(OperationFilter::from_expr(expr)?),
        None => None,
    };
    Ok(match (config.default_api_exclusions, user) {
        (true, Some(user)) => OperationFilter::default_api_exclusions().merge(user),
        (true, None) => OperationFilter::default_api_exclusions(),
        (false, Some(user)) => user,
        (false, None) => OperationFilter::all(),
    })
}

/// One tracing session over a [`TraceSource`]
pub struct TraceSession {
    id: u64,
    config: TraceConfig,
    state: Mutex<SessionState>,
    source: Arc<dyn TraceSource>,
    registry: Arc<CorrelationRegistry>,
    dispatcher: Arc<DeferredDispatcher>,
    span_ids: Arc<SpanIdAllocator>,
    skew: Arc<ClockSkew>,
    threads: ThreadIndex,
    cpu: CpuEventHandler,
    drainer: DeviceDrainer,
    critical: Option<Arc<CriticalTrace>>,
    api_filter: OperationFilter,
    activity_filter: OperationFilter,
    setup: Mutex<Vec<(String, Routine)>>,
    teardown: Mutex<Vec<(String, Routine)>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl TraceSession {
    pub fn builder(config: TraceConfig, source: Arc<dyn TraceSource>) -> TraceSessionBuilder {
        TraceSessionBuilder {
            config,
            source,
            spans: None,
            durations: None,
            skew: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *guard(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Run `routine` during `start`, after the source is enabled
    pub fn on_setup(&self, name: impl Into<String>, routine: Routine) {
        guard(&self.setup).push((name.into(), routine));
    }

    /// Run `routine` during `shutdown`, after the source is disabled
    pub fn on_shutdown(&self, name: impl Into<String>, routine: Routine) {
        guard(&self.teardown).push((name.into(), routine));
    }

    /// Enable every tracing domain and run setup routines
    ///
    /// A domain that fails to enable is logged and skipped; the session still
    /// becomes active. Starting an active session is a no-op.
    ///
    /// # Errors
    ///
    /// [`TraceError::Inactive`] if the session was already shut down.
    pub fn start(&self) -> TraceResult<()> {
        {
            let mut state = guard(&self.state);
            match *state {
                SessionState::Active => return Ok(()),
                SessionState::Finalized => return Err(TraceError::Inactive),
                SessionState::Inactive => *state = SessionState::Active,
            }
        }

        for domain in TraceDomain::ALL {
            let filter = match domain {
                TraceDomain::CorrelatedApi | TraceDomain::UntrackedApi => &self.api_filter,
                TraceDomain::DeviceActivity | TraceDomain::UntrackedActivity => {
                    &self.activity_filter
                }
            };
            if let Err(err) = self.source.enable(domain, filter) {
                tracing::warn!(session = self.id, %domain, "enable failed: {}", err);
            }
        }

        let routines = std::mem::take(&mut *guard(&self.setup));
        run_routines("setup", routines);

        tracing::info!(session = self.id, source = self.source.name(), "trace session started");
        Ok(())
    }

    /// Stop tracing and release everything the session holds
    ///
    /// Open correlation records are discarded, pending deferred work runs, the
    /// dispatcher's workers are joined and every domain is disabled. Calling it
    /// again is a no-op.
    pub fn shutdown(&self) -> TraceResult<ShutdownReport> {
        {
            let mut state = guard(&self.state);
            if *state == SessionState::Finalized {
                return Ok(ShutdownReport::default());
            }
            *state = SessionState::Finalized;
        }

        let discarded = self.registry.force_drain();
        for (cid, record) in &discarded {
            tracing::debug!(
                cid,
                name = %record.display_name,
                thread = record.owning_thread_id,
                "open correlation record discarded at shutdown"
            );
        }

        let executed_before = self.dispatcher.stats().executed;
        self.dispatcher.shutdown();
        let flushed_jobs = self.dispatcher.stats().executed - executed_before;

        let mut disable_failures = 0;
        for domain in TraceDomain::ALL {
            if let Err(err) = self.source.disable(domain) {
                disable_failures += 1;
                tracing::warn!(session = self.id, %domain, "disable failed: {}", err);
            }
        }

        let routines = std::mem::take(&mut *guard(&self.teardown));
        run_routines("shutdown", routines);
        release_thread_context(self.id);

        let report = ShutdownReport {
            discarded_records: discarded.len(),
            flushed_jobs,
            disable_failures,
        };
        tracing::info!(
            session = self.id,
            discarded = report.discarded_records,
            flushed = report.flushed_jobs,
            "trace session finalized"
        );
        Ok(report)
    }

    /// CPU callback on the calling thread
    pub fn on_cpu_event(&self, event: &CpuEvent, now_ns: u64) -> CpuOutcome {
        if !self.is_active() {
            return CpuOutcome::Ignored;
        }
        with_thread_context(self.id, &self.threads, self.config.lap_retention, |ctx| {
            self.cpu.handle(ctx, event, now_ns)
        })
    }

    /// Device activity batch delivered on the calling thread
    pub fn on_device_batch(&self, records: &[DeviceRecord]) -> DrainReport {
        if !self.is_active() {
            return inactive_report(records);
        }
        with_thread_context(self.id, &self.threads, self.config.lap_retention, |ctx| {
            self.drainer.drain(ctx, records)
        })
    }

    /// Activity with no correlated CPU call
    pub fn on_untracked_activity(&self, records: &[DeviceRecord]) -> DrainReport {
        if !self.is_active() {
            return inactive_report(records);
        }
        with_thread_context(self.id, &self.threads, self.config.lap_retention, |ctx| {
            self.drainer.drain_untracked(ctx, records)
        })
    }

    /// A detached context for callers that track threads themselves
    pub fn thread_context(&self, thread_id: u64) -> ThreadContext {
        ThreadContext::new(thread_id, self.config.lap_retention)
    }

    /// [`on_cpu_event`](Self::on_cpu_event) against an explicit context
    pub fn on_cpu_event_in(
        &self,
        ctx: &mut ThreadContext,
        event: &CpuEvent,
        now_ns: u64,
    ) -> CpuOutcome {
        if !self.is_active() {
            return CpuOutcome::Ignored;
        }
        self.cpu.handle(ctx, event, now_ns)
    }

    /// [`on_device_batch`](Self::on_device_batch) against an explicit context
    pub fn on_device_batch_in(&self, ctx: &mut ThreadContext, records: &[DeviceRecord]) -> DrainReport {
        if !self.is_active() {
            return inactive_report(records);
        }
        self.drainer.drain(ctx, records)
    }

    /// [`on_untracked_activity`](Self::on_untracked_activity) against an explicit context
    pub fn on_untracked_activity_in(
        &self,
        ctx: &mut ThreadContext,
        records: &[DeviceRecord],
    ) -> DrainReport {
        if !self.is_active() {
            return inactive_report(records);
        }
        self.drainer.drain_untracked(ctx, records)
    }

    /// Run deferred work queued for `thread_id`
    pub fn flush(&self, thread_id: u64) {
        self.dispatcher.flush(thread_id);
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Collected critical-trace entries, when enabled
    pub fn critical_trace(&self) -> Option<&Arc<CriticalTrace>> {
        self.critical.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            registry: self.registry.stats(),
            open_records: self.registry.len(),
            dispatcher: self.dispatcher.stats(),
            cpu: self.cpu.stats(),
            drainer: self.drainer.stats(),
            threads: self.threads.count(),
            span_ids: self.span_ids.allocated(),
            skew_offset: self.skew.calibration().map(|c| c.offset),
        }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(err) = self.shutdown() {
                tracing::warn!("session shutdown on drop failed: {}", err);
            }
        }
    }
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("source", &self.source.name())
            .field("drainer", &self.drainer)
            .finish_non_exhaustive()
    }
}

fn inactive_report(records: &[DeviceRecord]) -> DrainReport {
    tracing::trace!(records = records.len(), "device batch ignored: session inactive");
    DrainReport {
        advanced: records.len(),
        ..DrainReport::default()
    }
}

fn run_routines(phase: &str, routines: Vec<(String, Routine)>) {
    for (name, routine) in routines {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(routine)) {
            Ok(Ok(())) => tracing::debug!(phase, routine = %name, "routine done"),
            Ok(Err(err)) => tracing::warn!(phase, routine = %name, "routine failed: {}", err),
            Err(_) => tracing::warn!(phase, routine = %name, "routine panicked"),
        }
    }
}
