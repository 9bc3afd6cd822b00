//! Multi-threaded correlation
//!
//! Application threads enter/exit calls through the session's thread-local
//! contexts while another thread drains device activity.

use hetrace::aggregator::DurationAggregator;
use hetrace::clock_skew::ClockSkew;
use hetrace::config::TraceConfig;
use hetrace::cpu_handler::{CpuEvent, CpuOutcome};
use hetrace::device_drainer::{DeviceRecord, OpKind};
use hetrace::dispatcher::DeferredDispatcher;
use hetrace::recorder::TraceRecorder;
use hetrace::session::TraceSession;
use hetrace::span_record::SpanKind;
use hetrace::trace_source::FakeTraceSource;
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

const THREADS: u64 = 4;
const CALLS: u64 = 50;

#[test]
fn test_parallel_threads_keep_their_own_stacks() {
    let recorder = Arc::new(TraceRecorder::new());
    let aggregator = Arc::new(DurationAggregator::new());
    let config = TraceConfig {
        worker_threads: 2,
        ..TraceConfig::default()
    };
    let session = Arc::new(
        TraceSession::builder(config, Arc::new(FakeTraceSource::new()))
            .span_sink(recorder.clone())
            .duration_sink(aggregator.clone())
            .clock_skew(ClockSkew::fixed(0))
            .build()
            .unwrap(),
    );
    session.start().unwrap();

    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let session = session.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..CALLS {
                    let cid = t * 1_000 + i;
                    let ts = i * 100;
                    let outer = session.on_cpu_event(
                        &CpuEvent::enter("hipLaunchKernel", cid).with_kernel("k"),
                        ts,
                    );
                    let CpuOutcome::Entered(outer) = outer else {
                        panic!("enter not recorded: {:?}", outer);
                    };
                    assert_eq!(outer.depth, 0);

                    session.on_device_batch(&[DeviceRecord::new(cid, OpKind::Dispatch, ts + 1, ts + 5)]);

                    let inner = session.on_cpu_event(&CpuEvent::enter("hipMemcpy", cid + 500), ts + 10);
                    let CpuOutcome::Entered(inner) = inner else {
                        panic!("nested enter not recorded: {:?}", inner);
                    };
                    assert_eq!(inner.depth, 1);
                    assert_eq!(inner.parent_span_id, Some(outer.span_id));

                    session.on_cpu_event(&CpuEvent::exit("hipMemcpy", cid + 500), ts + 20);
                    session.on_cpu_event(&CpuEvent::exit("hipLaunchKernel", cid), ts + 30);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = session.shutdown().unwrap();
    assert_eq!(report.discarded_records, 0);

    let total = (THREADS * CALLS) as usize;
    let cpu = recorder.records_of(SpanKind::Cpu);
    let device = recorder.records_of(SpanKind::Device);
    assert_eq!(cpu.len(), total * 2);
    assert_eq!(device.len(), total);
    assert!(device.iter().all(|d| d.depth == 1 && d.lap == Some(1)));

    let ids: HashSet<_> = cpu.iter().map(|s| s.span_id).collect();
    assert_eq!(ids.len(), cpu.len());

    // every deferred aggregation ran by the time shutdown returned
    assert_eq!(aggregator.get("k").unwrap().count, total as u64);
    assert_eq!(aggregator.get("hipMemcpy").unwrap().count, total as u64);
    assert_eq!(session.stats().threads, THREADS);
}

#[test]
fn test_dispatcher_preserves_per_owner_order() {
    let dispatcher = Arc::new(DeferredDispatcher::new(3, 1_000).unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..THREADS)
        .map(|owner| {
            let dispatcher = dispatcher.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                for i in 0..CALLS {
                    let seen = seen.clone();
                    dispatcher.submit(owner, move || seen.lock().unwrap().push((owner, i)));
                }
                dispatcher.flush(owner);
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    dispatcher.shutdown();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), (THREADS * CALLS) as usize);
    for owner in 0..THREADS {
        let order: Vec<u64> = seen
            .iter()
            .filter(|(o, _)| *o == owner)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(order, (0..CALLS).collect::<Vec<_>>());
    }
}

#[test]
fn test_sessions_are_isolated_on_one_thread() {
    let first_recorder = Arc::new(TraceRecorder::new());
    let first = TraceSession::builder(TraceConfig::default(), Arc::new(FakeTraceSource::new()))
        .span_sink(first_recorder.clone())
        .build()
        .unwrap();
    let second = TraceSession::builder(TraceConfig::default(), Arc::new(FakeTraceSource::new()))
        .build()
        .unwrap();
    first.start().unwrap();
    second.start().unwrap();

    first.on_cpu_event(&CpuEvent::enter("hipMalloc", 1), 0);
    let other = second.on_cpu_event(&CpuEvent::enter("hipMalloc", 1), 5);
    let CpuOutcome::Entered(other) = other else {
        panic!("second session did not enter");
    };
    // a fresh context: not nested under the first session's open call
    assert_eq!(other.depth, 0);

    first.on_cpu_event(&CpuEvent::exit("hipMalloc", 1), 10);
    assert_eq!(first_recorder.len(), 1);
}
