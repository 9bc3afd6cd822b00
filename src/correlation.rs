//! Correlation registry
//!
//! Maps a runtime-issued [`CorrelationId`] to what a device drainer needs to link
//! a completion record back to the CPU call that launched it.
//!
//! # Tables
//!
//! ```text
//! key table       cid -> (display_name, owning_thread_id)     Mutex #1
//! identity table  cid -> SpanIdentity                        Mutex #2
//! ```
//!
//! Each table has its own lock and no operation holds both at once. Values are
//! copied out under the lock and all further work happens after release.
//!
//! # Lifecycle
//!
//! - `register` at CPU enter (overwrites; the last writer is authoritative)
//! - `lookup` from any drainer, any number of times (never removes)
//! - `close` at CPU exit (removes; absent ids yield a degraded identity)

use crate::span_id::{CorrelationId, SpanIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Everything known about one open CPU call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub display_name: String,
    pub owning_thread_id: u64,
    pub span_identity: SpanIdentity,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    pub overwritten: u64,
    pub closed: u64,
    /// `close` on an id that was never registered or already closed
    pub missing_on_close: u64,
    pub lookups: u64,
    pub lookup_misses: u64,
}

/// Thread-safe correlation tables
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    keys: Mutex<HashMap<CorrelationId, (String, u64)>>,
    identities: Mutex<HashMap<CorrelationId, SpanIdentity>>,
    registered: AtomicU64,
    overwritten: AtomicU64,
    closed: AtomicU64,
    missing_on_close: AtomicU64,
    lookups: AtomicU64,
    lookup_misses: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking sink cannot leave the maps half-written; keep going
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open call; replaces any existing entry for `cid`
    pub fn register(
        &self,
        cid: CorrelationId,
        name: impl Into<String>,
        thread_id: u64,
        identity: SpanIdentity,
    ) {
        // identity before key: `lookup_record` reads the key first, so a
        // visible key always has its identity behind it
        guard(&self.identities).insert(cid, identity);
        let previous = guard(&self.keys).insert(cid, (name.into(), thread_id));

        self.registered.fetch_add(1, Ordering::Relaxed);
        if previous.is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cid, "correlation id re-registered while open");
        }
    }

    /// Identity registered for `cid`, without removing it
    ///
    /// Returns the degraded identity and `false` when `cid` is unknown.
    pub fn lookup(&self, cid: CorrelationId) -> (SpanIdentity, bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let found = guard(&self.identities).get(&cid).copied();
        match found {
            Some(identity) => (identity, true),
            None => {
                self.lookup_misses.fetch_add(1, Ordering::Relaxed);
                (SpanIdentity::degraded(), false)
            }
        }
    }

    /// Full record for `cid`, without removing it
    pub fn lookup_record(&self, cid: CorrelationId) -> Option<CorrelationRecord> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let key = guard(&self.keys).get(&cid).cloned();
        let identity = guard(&self.identities).get(&cid).copied();

        match (key, identity) {
            (Some((display_name, owning_thread_id)), Some(span_identity)) => {
                Some(CorrelationRecord {
                    display_name,
                    owning_thread_id,
                    span_identity,
                })
            }
            _ => {
                self.lookup_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove `cid` and return its identity
    ///
    /// Closing an absent id is not an error: the degraded identity is returned.
    pub fn close(&self, cid: CorrelationId) -> SpanIdentity {
        guard(&self.keys).remove(&cid);
        let identity = guard(&self.identities).remove(&cid);

        match identity {
            Some(identity) => {
                self.closed.fetch_add(1, Ordering::Relaxed);
                identity
            }
            None => {
                self.missing_on_close.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cid, "close on unregistered correlation id");
                SpanIdentity::degraded()
            }
        }
    }

    /// Remove and return every open record
    pub fn force_drain(&self) -> Vec<(CorrelationId, CorrelationRecord)> {
        let keys: Vec<_> = guard(&self.keys).drain().collect();
        let mut identities = std::mem::take(&mut *guard(&self.identities));

        let mut drained: Vec<_> = keys
            .into_iter()
            .map(|(cid, (display_name, owning_thread_id))| {
                let span_identity = identities
                    .remove(&cid)
                    .unwrap_or_else(SpanIdentity::degraded);
                (
                    cid,
                    CorrelationRecord {
                        display_name,
                        owning_thread_id,
                        span_identity,
                    },
                )
            })
            .collect();
        drained.sort_by_key(|(cid, _)| *cid);
        drained
    }

    /// Open records
    pub fn len(&self) -> usize {
        guard(&self.identities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.registered.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            missing_on_close: self.missing_on_close.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_misses: self.lookup_misses.load(Ordering::Relaxed),
        }
    }
}
