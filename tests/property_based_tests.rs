//! Property-based tests for the correlation engine
//!
//! Covers:
//! 1. Stack discipline of span depths on one thread, including reused ids
//! 2. Closing absent correlation ids
//! 3. Lap ordinals per correlation id
//! 4. Constant clock skew
//! 5. Cursor advancement over mixed batches

use hetrace::clock_skew::{apply_skew, ClockSkew, HostClock};
use hetrace::config::{LapRetention, TraceConfig};
use hetrace::correlation::CorrelationRegistry;
use hetrace::cpu_handler::{CpuEvent, CpuOutcome};
use hetrace::device_drainer::{DeviceDrainer, DeviceRecord, OpKind};
use hetrace::dispatcher::DeferredDispatcher;
use hetrace::recorder::TraceRecorder;
use hetrace::session::TraceSession;
use hetrace::sink::{SinkSet, SpanSink};
use hetrace::span_id::{SpanId, SpanIdAllocator, SpanIdentity};
use hetrace::thread_context::ThreadContext;
use hetrace::trace_source::{DeviceClock, FakeTraceSource};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn drainer(offset: i64, recorder: Option<Arc<TraceRecorder>>) -> (DeviceDrainer, Arc<CorrelationRegistry>) {
    let registry = Arc::new(CorrelationRegistry::new());
    let sinks = SinkSet {
        spans: recorder.map(|r| r as Arc<dyn SpanSink>),
        ..SinkSet::default()
    };
    let drainer = DeviceDrainer::new(
        registry.clone(),
        Arc::new(DeferredDispatcher::synchronous()),
        Arc::new(ClockSkew::fixed(offset)),
        Arc::new(FakeTraceSource::new()),
        sinks,
    );
    (drainer, registry)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_depths_follow_stack_discipline(ops in prop::collection::vec(any::<bool>(), 1..64)) {
        // true = enter, false = exit of the innermost open call
        let alloc = SpanIdAllocator::new();
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);
        let mut open: Vec<SpanIdentity> = Vec::new();

        for (ts, enter) in ops.into_iter().enumerate() {
            if enter {
                let identity = ctx.push_call(&alloc, ts as u64);
                match open.last() {
                    Some(parent) => {
                        prop_assert_eq!(identity.depth, parent.depth + 1);
                        prop_assert_eq!(identity.parent_span_id, Some(parent.span_id));
                    }
                    None => {
                        prop_assert_eq!(identity.depth, 0);
                        prop_assert_eq!(identity.parent_span_id, None);
                    }
                }
                let ancestors: HashSet<_> = open.iter().map(|i| i.span_id).collect();
                prop_assert!(!ancestors.contains(&identity.span_id));
                open.push(identity);
            } else if let Some(top) = open.pop() {
                let closed = ctx.pop_call(top.span_id);
                prop_assert_eq!(closed.map(|c| c.identity), Some(top));
            }
            prop_assert_eq!(ctx.depth(), open.len());
        }
    }

    #[test]
    fn prop_depths_hold_with_reused_ids(ops in prop::collection::vec(prop::option::of(0u64..4), 1..64)) {
        // Some(cid) = enter under a small, frequently reused id; None = exit of
        // the innermost open call with the id it entered under
        let session = TraceSession::builder(TraceConfig::default(), Arc::new(FakeTraceSource::new()))
            .build()
            .unwrap();
        session.start().unwrap();
        let mut ctx = session.thread_context(3);
        let mut open: Vec<(u64, SpanIdentity)> = Vec::new();

        for (ts, op) in ops.into_iter().enumerate() {
            match op {
                Some(cid) => {
                    let outcome = session.on_cpu_event_in(&mut ctx, &CpuEvent::enter("hipMemcpy", cid), ts as u64);
                    let CpuOutcome::Entered(identity) = outcome else {
                        return Err(TestCaseError::fail(format!("enter not recorded: {:?}", outcome)));
                    };
                    prop_assert_eq!(identity.depth as usize, open.len());
                    prop_assert_eq!(identity.parent_span_id, open.last().map(|(_, p)| p.span_id));
                    open.push((cid, identity));
                }
                None => {
                    if let Some((cid, _)) = open.pop() {
                        session.on_cpu_event_in(&mut ctx, &CpuEvent::exit("hipMemcpy", cid), ts as u64);
                    }
                }
            }
            prop_assert_eq!(ctx.depth(), open.len());
        }
    }

    #[test]
    fn prop_close_absent_is_degraded(cids in prop::collection::vec(any::<u64>(), 1..32)) {
        let registry = CorrelationRegistry::new();
        for cid in cids {
            let identity = registry.close(cid);
            prop_assert!(identity.is_degraded());
            prop_assert_eq!(identity.depth, 0);
            prop_assert_eq!(identity.parent_span_id, None);
        }
        prop_assert!(registry.is_empty());
    }

    #[test]
    fn prop_laps_are_one_to_n(n in 1usize..50, cid in any::<u64>()) {
        let recorder = Arc::new(TraceRecorder::new());
        let (drainer, _) = drainer(0, Some(recorder.clone()));
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);

        let batch: Vec<_> = (0..n as u64)
            .map(|i| DeviceRecord::new(cid, OpKind::Dispatch, i * 10, i * 10 + 5))
            .collect();
        drainer.drain(&mut ctx, &batch);

        let laps: Vec<u32> = recorder.records().iter().filter_map(|r| r.lap).collect();
        let expected: Vec<u32> = (1..=n as u32).collect();
        prop_assert_eq!(laps, expected);
    }

    #[test]
    fn prop_skew_applied_identically(
        offset in -1_000_000i64..1_000_000,
        stamps in prop::collection::vec(2_000_000u64..u64::MAX / 2, 1..20),
    ) {
        let skew = ClockSkew::fixed(offset);
        let source = FakeTraceSource::new().with_device_offset(123_456);
        for ts in stamps {
            // later calibration attempts never change a cached offset
            prop_assert_eq!(skew.offset(&HostClock, &DeviceClock(&source)), offset);
            prop_assert_eq!(skew.apply(ts), apply_skew(ts, offset));
            prop_assert_eq!(skew.apply(ts) as i128, ts as i128 + offset as i128);
        }
    }

    #[test]
    fn prop_cursor_advances_once_per_record(
        ops in prop::collection::vec(0u32..6, 0..64),
        registered in any::<bool>(),
    ) {
        let (drainer, registry) = drainer(0, None);
        if registered {
            registry.register(1, "k", 0, SpanIdentity::root(SpanId::from_raw(1)));
        }
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);

        let batch: Vec<_> = ops
            .iter()
            .enumerate()
            .map(|(i, &op)| {
                let begin = i as u64 * 10;
                // every third record is a clock anomaly
                let end = if i % 3 == 0 { begin } else { begin + 5 };
                let mut record = DeviceRecord::new(1, OpKind::Dispatch, begin, end);
                record.op = op;
                record
            })
            .collect();

        let report = drainer.drain(&mut ctx, &batch);
        prop_assert_eq!(report.advanced, batch.len());
        prop_assert_eq!(
            report.emitted + report.skipped_unsupported + report.dropped_anomalies + report.filtered,
            batch.len()
        );
    }
}
