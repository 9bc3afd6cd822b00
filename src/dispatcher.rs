//! Deferred work dispatcher
//!
//! Some sink writes are unsafe to perform from inside a vendor runtime callback
//! (reentrant locks inside the runtime). Those writes are packaged as jobs and
//! run later, either on a small worker pool or at the submitting thread's next
//! flush point.
//!
//! # Design
//!
//! ```text
//! drainer thread                        worker pool (N > 0)
//!   submit(owner, job) ───channel───▶   worker[owner % N]: run jobs in order
//!                                       Barrier(ack) ──▶ ack.send(())
//! CPU thread (owner)
//!   flush(owner) ──Barrier──▶ blocks until ack
//!
//! no pool (N = 0)
//!   submit(owner, job) ──▶ queues[owner].push_back(job)
//!   flush(owner)       ──▶ run queues[owner] on the caller, FIFO
//! ```
//!
//! Each worker has exactly one consumer, so jobs for one owner keep their
//! submission order. Nothing is promised across owners.
//!
//! Queues are unbounded. Crossing `warn_threshold` pending jobs logs a single
//! warning per dispatcher.

use crate::error::TraceResult;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A unit of deferred work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Barrier(Sender<()>),
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    panicked: AtomicU64,
    pending: AtomicUsize,
}

impl Counters {
    fn run(&self, job: Job) {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("deferred job panicked; continuing");
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub executed: u64,
    pub panicked: u64,
    pub pending: usize,
    pub workers: usize,
}

/// Per-owner FIFO job queue with optional worker pool
pub struct DeferredDispatcher {
    senders: Vec<Sender<Message>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    local: Mutex<HashMap<u64, VecDeque<Job>>>,
    counters: Arc<Counters>,
    next_spawn: AtomicUsize,
    warn_threshold: usize,
    warned: AtomicBool,
    stopped: AtomicBool,
}

impl DeferredDispatcher {
    /// Create a dispatcher with `worker_threads` workers (0 = no pool)
    ///
    /// # Errors
    ///
    /// Fails if a worker thread cannot be spawned.
    pub fn new(worker_threads: usize, warn_threshold: usize) -> TraceResult<Self> {
        let counters = Arc::new(Counters::default());
        let mut senders = Vec::with_capacity(worker_threads);
        let mut handles = Vec::with_capacity(worker_threads);

        for index in 0..worker_threads {
            let (tx, rx) = channel::unbounded();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(format!("hetrace-worker-{}", index))
                .spawn(move || Self::worker_loop(rx, counters))?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            senders,
            handles: Mutex::new(handles),
            local: Mutex::new(HashMap::new()),
            counters,
            next_spawn: AtomicUsize::new(0),
            warn_threshold,
            warned: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Dispatcher without a pool; jobs run at flush points
    pub fn synchronous() -> Self {
        Self {
            senders: Vec::new(),
            handles: Mutex::new(Vec::new()),
            local: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            next_spawn: AtomicUsize::new(0),
            warn_threshold: usize::MAX,
            warned: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    fn worker_loop(rx: Receiver<Message>, counters: Arc<Counters>) {
        for message in rx.iter() {
            match message {
                Message::Run(job) => counters.run(job),
                Message::Barrier(ack) => {
                    let _ = ack.send(());
                }
                Message::Stop => break,
            }
        }
    }

    /// Queue `job` behind every earlier job submitted for `owner`
    pub fn submit<F>(&self, owner: u64, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        self.account_submit();

        if self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(owner, "dispatcher stopped, running job inline");
            self.counters.run(job);
            return;
        }

        if self.senders.is_empty() {
            let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
            local.entry(owner).or_default().push_back(job);
            return;
        }

        let worker = (owner % self.senders.len() as u64) as usize;
        if let Err(channel::SendError(Message::Run(job))) =
            self.senders[worker].send(Message::Run(job))
        {
            self.counters.run(job);
        }
    }

    /// Run `job` with no owner: on the pool if there is one, else right now
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        self.account_submit();

        if self.senders.is_empty() || self.stopped.load(Ordering::SeqCst) {
            self.counters.run(job);
            return;
        }

        let worker = self.next_spawn.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if let Err(channel::SendError(Message::Run(job))) =
            self.senders[worker].send(Message::Run(job))
        {
            self.counters.run(job);
        }
    }

    /// Block until every job submitted for `owner` so far has run
    ///
    /// Without a pool the owner's queue is run on the calling thread. Must not be
    /// called from inside a job.
    pub fn flush(&self, owner: u64) {
        if self.senders.is_empty() {
            self.run_local(owner);
            return;
        }

        let worker = (owner % self.senders.len() as u64) as usize;
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.senders[worker].send(Message::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Run every local queue, stop and join the workers
    ///
    /// Idempotent. Jobs submitted afterwards run inline.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let owners: Vec<u64> = {
            let local = self.local.lock().unwrap_or_else(|p| p.into_inner());
            let mut owners: Vec<u64> = local.keys().copied().collect();
            owners.sort_unstable();
            owners
        };
        for owner in owners {
            self.run_local(owner);
        }

        for sender in &self.senders {
            let _ = sender.send(Message::Stop);
        }
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("dispatcher worker exited abnormally");
            }
        }

        tracing::debug!(stats = ?self.stats(), "dispatcher shut down");
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
            workers: self.senders.len(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    fn account_submit(&self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let pending = self.counters.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if pending > self.warn_threshold && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                pending,
                threshold = self.warn_threshold,
                "deferred work queue is growing; device activity outpaces flush points"
            );
        }
    }

    fn run_local(&self, owner: u64) {
        // jobs may submit more work for the same owner; keep going until empty
        loop {
            let queued = {
                let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
                match local.get_mut(&owner) {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    _ => return,
                }
            };
            for job in queued {
                self.counters.run(job);
            }
        }
    }
}

impl Drop for DeferredDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeferredDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDispatcher")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_synchronous_runs_at_flush() {
        let dispatcher = DeferredDispatcher::new(0, 1024).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            dispatcher.submit(7, move || log.lock().unwrap().push(i));
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(dispatcher.stats().pending, 3);

        dispatcher.flush(7);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(dispatcher.stats().executed, 3);
        assert_eq!(dispatcher.stats().pending, 0);
    }

    #[test]
    fn test_flush_only_runs_owner_queue() {
        let dispatcher = DeferredDispatcher::synchronous();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        dispatcher.submit(1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = count.clone();
        dispatcher.submit(2, move || {
            c.fetch_add(10, Ordering::SeqCst);
        });

        dispatcher.flush(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        dispatcher.flush(2);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_pool_preserves_per_owner_order() {
        let dispatcher = DeferredDispatcher::new(3, 1 << 20).unwrap();
        let logs: Vec<_> = (0..4).map(|_| Arc::new(StdMutex::new(Vec::new()))).collect();

        for i in 0..200u64 {
            for (owner, log) in logs.iter().enumerate() {
                let log = log.clone();
                dispatcher.submit(owner as u64, move || log.lock().unwrap().push(i));
            }
        }
        for owner in 0..4 {
            dispatcher.flush(owner);
        }

        let expected: Vec<u64> = (0..200).collect();
        for log in &logs {
            assert_eq!(*log.lock().unwrap(), expected);
        }
        dispatcher.shutdown();
        assert_eq!(dispatcher.stats().executed, 800);
    }

    #[test]
    fn test_spawn_runs_inline_without_pool() {
        let dispatcher = DeferredDispatcher::synchronous();
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        dispatcher.spawn(move || h.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let dispatcher = DeferredDispatcher::new(1, 1024).unwrap();
        let hit = Arc::new(AtomicBool::new(false));

        dispatcher.submit(0, || panic!("sink exploded"));
        let h = hit.clone();
        dispatcher.submit(0, move || h.store(true, Ordering::SeqCst));
        dispatcher.flush(0);

        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(dispatcher.stats().panicked, 1);
    }

    #[test]
    fn test_shutdown_drains_local_queues() {
        let dispatcher = DeferredDispatcher::synchronous();
        let count = Arc::new(AtomicU64::new(0));
        for owner in 0..5 {
            let c = count.clone();
            dispatcher.submit(owner, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 5);

        // after shutdown, submit runs inline
        let c = count.clone();
        dispatcher.submit(9, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_queue_pressure_warns_once() {
        let dispatcher = DeferredDispatcher::new(0, 2).unwrap();
        for _ in 0..5 {
            dispatcher.submit(0, || {});
        }
        assert!(dispatcher.warned.load(Ordering::Relaxed));
        dispatcher.flush(0);
        assert_eq!(dispatcher.stats().pending, 0);
    }
}
