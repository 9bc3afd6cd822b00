//! Per-thread tracing state
//!
//! Everything here is owned by exactly one OS thread and needs no locking:
//!
//! - the stack of open CPU calls ("current span" is the top),
//! - lap counters for device records drained on this thread,
//! - begin timestamps of open calls in the untracked API domain.
//!
//! Contexts are created lazily the first time a thread enters a session and are
//! dropped with the thread. A context is keyed by session id so independent
//! sessions (e.g. one per test) never share state.

use crate::config::LapRetention;
use crate::span_id::{CorrelationId, SpanId, SpanIdAllocator, SpanIdentity};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-correlation-id lap counter
///
/// `next(cid)` returns 1, 2, 3, ... for successive records sharing `cid`.
#[derive(Debug, Default)]
pub struct LapCounter {
    laps: HashMap<CorrelationId, u32>,
    order: VecDeque<CorrelationId>,
    retention: LapRetention,
    evicted: u64,
}

impl LapCounter {
    pub fn new(retention: LapRetention) -> Self {
        Self {
            retention,
            ..Default::default()
        }
    }

    /// Ordinal of the next record for `cid`, starting at 1
    pub fn next(&mut self, cid: CorrelationId) -> u32 {
        if let Some(lap) = self.laps.get_mut(&cid) {
            *lap = lap.saturating_add(1);
            return *lap;
        }

        self.laps.insert(cid, 1);
        if let LapRetention::Bounded { max_entries } = self.retention {
            self.order.push_back(cid);
            while self.laps.len() > max_entries {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.laps.remove(&oldest);
                        self.evicted += 1;
                    }
                    None => break,
                }
            }
        }
        1
    }

    /// Number of live counters
    pub fn len(&self) -> usize {
        self.laps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.laps.is_empty()
    }

    /// Counters dropped by the bounded retention policy
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// An entered call awaiting its exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCall {
    pub identity: SpanIdentity,
    pub begin_ns: u64,
}

/// State owned by one thread for one session
#[derive(Debug)]
pub struct ThreadContext {
    thread_id: u64,
    stack: Vec<OpenCall>,
    laps: LapCounter,
    untracked_begin: Vec<u64>,
    signals_blocked: bool,
}

impl ThreadContext {
    pub fn new(thread_id: u64, retention: LapRetention) -> Self {
        Self {
            thread_id,
            stack: Vec::new(),
            laps: LapCounter::new(retention),
            untracked_begin: Vec::new(),
            signals_blocked: false,
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Identity for a new call under the current top, without pushing it
    pub fn next_identity(&self, alloc: &SpanIdAllocator) -> SpanIdentity {
        let span_id = alloc.next_id();
        match self.current() {
            Some(parent) => SpanIdentity::child_of(span_id, parent),
            None => SpanIdentity::root(span_id),
        }
    }

    /// Open a call: allocate an identity under the current top and push it
    pub fn push_call(&mut self, alloc: &SpanIdAllocator, begin_ns: u64) -> SpanIdentity {
        let identity = self.next_identity(alloc);
        self.stack.push(OpenCall { identity, begin_ns });
        identity
    }

    /// Close the call `span_id`
    ///
    /// Pops down to and including the matching entry. Entries above it belong to
    /// calls whose exit was never delivered and are discarded. Returns None when
    /// `span_id` is not on the stack (the stack is left untouched).
    pub fn pop_call(&mut self, span_id: SpanId) -> Option<OpenCall> {
        let pos = self
            .stack
            .iter()
            .rposition(|call| call.identity.span_id == span_id)?;
        let unclosed = self.stack.len() - pos - 1;
        if unclosed > 0 {
            tracing::debug!(
                thread = self.thread_id,
                unclosed,
                "discarding calls without exit"
            );
        }
        let call = self.stack[pos];
        self.stack.truncate(pos);
        Some(call)
    }

    /// Close the innermost call regardless of its id
    pub fn pop_top(&mut self) -> Option<OpenCall> {
        self.stack.pop()
    }

    /// Innermost open call
    pub fn current(&self) -> Option<&SpanIdentity> {
        self.stack.last().map(|call| &call.identity)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn laps_mut(&mut self) -> &mut LapCounter {
        &mut self.laps
    }

    pub fn laps(&self) -> &LapCounter {
        &self.laps
    }

    pub(crate) fn push_untracked(&mut self, begin_ns: u64) {
        self.untracked_begin.push(begin_ns);
    }

    pub(crate) fn pop_untracked(&mut self) -> Option<u64> {
        self.untracked_begin.pop()
    }

    /// Returns true exactly once per context
    pub(crate) fn mark_signals_blocked(&mut self) -> bool {
        !std::mem::replace(&mut self.signals_blocked, true)
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            tracing::debug!(
                thread = self.thread_id,
                open = self.stack.len(),
                "thread context dropped with open calls"
            );
        }
    }
}

/// Sequential thread index allocator, one per session
#[derive(Debug, Default)]
pub struct ThreadIndex {
    next: AtomicU64,
}

impl ThreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn assign(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Threads seen so far
    pub fn count(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

thread_local! {
    static CONTEXTS: RefCell<HashMap<u64, ThreadContext>> = RefCell::new(HashMap::new());
}

/// Run `f` with this thread's context for `session_id`, creating it on first use
///
/// `f` must not re-enter `with_thread_context` on the same thread.
pub fn with_thread_context<R>(
    session_id: u64,
    index: &ThreadIndex,
    retention: LapRetention,
    f: impl FnOnce(&mut ThreadContext) -> R,
) -> R {
    CONTEXTS.with(|contexts| {
        let mut contexts = contexts.borrow_mut();
        let ctx = contexts
            .entry(session_id)
            .or_insert_with(|| ThreadContext::new(index.assign(), retention));
        f(ctx)
    })
}

/// Drop this thread's context for `session_id`, if any
pub fn release_thread_context(session_id: u64) -> bool {
    CONTEXTS.with(|contexts| contexts.borrow_mut().remove(&session_id).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lap_counter_sequence() {
        let mut laps = LapCounter::new(LapRetention::Unbounded);
        assert_eq!(laps.next(42), 1);
        assert_eq!(laps.next(42), 2);
        assert_eq!(laps.next(7), 1);
        assert_eq!(laps.next(42), 3);
        assert_eq!(laps.len(), 2);
    }

    #[test]
    fn test_lap_counter_bounded_evicts_oldest() {
        let mut laps = LapCounter::new(LapRetention::Bounded { max_entries: 2 });
        laps.next(1);
        laps.next(1);
        laps.next(2);
        laps.next(3); // evicts 1

        assert_eq!(laps.len(), 2);
        assert_eq!(laps.evicted(), 1);
        // 1 starts over after eviction
        assert_eq!(laps.next(1), 1);
        assert_eq!(laps.next(3), 2);
    }

    #[test]
    fn test_push_pop_stack_discipline() {
        let alloc = SpanIdAllocator::new();
        let mut ctx = ThreadContext::new(7, LapRetention::Unbounded);

        let outer = ctx.push_call(&alloc, 100);
        let inner = ctx.push_call(&alloc, 110);

        assert_eq!(outer.depth, 0);
        assert!(outer.parent_span_id.is_none());
        assert_eq!(inner.depth, 1);
        assert_eq!(inner.parent_span_id, Some(outer.span_id));
        assert_eq!(ctx.current(), Some(&inner));

        assert_eq!(ctx.pop_call(inner.span_id).unwrap().begin_ns, 110);
        assert_eq!(ctx.current(), Some(&outer));
        let closed = ctx.pop_call(outer.span_id).unwrap();
        assert_eq!(closed.identity, outer);
        assert_eq!(closed.begin_ns, 100);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_pop_unknown_span_leaves_stack() {
        let alloc = SpanIdAllocator::new();
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);
        ctx.push_call(&alloc, 0);

        assert!(ctx.pop_call(SpanId::from_raw(999)).is_none());
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_pop_discards_calls_without_exit() {
        let alloc = SpanIdAllocator::new();
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);
        let outer = ctx.push_call(&alloc, 0);
        ctx.push_call(&alloc, 1);
        ctx.push_call(&alloc, 2);

        assert!(ctx.pop_call(outer.span_id).is_some());
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_thread_local_contexts_are_per_session() {
        let index = ThreadIndex::new();
        let a = with_thread_context(1001, &index, LapRetention::Unbounded, |ctx| {
            ctx.laps_mut().next(5)
        });
        let b = with_thread_context(1001, &index, LapRetention::Unbounded, |ctx| {
            ctx.laps_mut().next(5)
        });
        let other = with_thread_context(1002, &index, LapRetention::Unbounded, |ctx| {
            ctx.laps_mut().next(5)
        });

        assert_eq!((a, b, other), (1, 2, 1));
        assert_eq!(index.count(), 2);
        assert!(release_thread_context(1001));
        assert!(release_thread_context(1002));
        assert!(!release_thread_context(1001));
    }

    #[test]
    fn test_each_thread_gets_its_own_index() {
        use std::sync::Arc;

        let index = Arc::new(ThreadIndex::new());
        let mut ids: Vec<u64> = (0..4)
            .map(|_| {
                let index = index.clone();
                std::thread::spawn(move || {
                    with_thread_context(2001, &index, LapRetention::Unbounded, |ctx| {
                        ctx.thread_id()
                    })
                })
            })
            .map(|h| h.join().unwrap())
            .collect();

        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_next_identity_does_not_push() {
        let alloc = SpanIdAllocator::new();
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);
        let outer = ctx.push_call(&alloc, 0);

        let leaf = ctx.next_identity(&alloc);
        assert_eq!(leaf.parent_span_id, Some(outer.span_id));
        assert_eq!(leaf.depth, 1);
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn test_untracked_begin_stack() {
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);
        ctx.push_untracked(10);
        ctx.push_untracked(20);
        assert_eq!(ctx.pop_untracked(), Some(20));
        assert_eq!(ctx.pop_untracked(), Some(10));
        assert_eq!(ctx.pop_untracked(), None);
    }

    #[test]
    fn test_signals_blocked_once() {
        let mut ctx = ThreadContext::new(0, LapRetention::Unbounded);
        assert!(ctx.mark_signals_blocked());
        assert!(!ctx.mark_signals_blocked());
    }
}
