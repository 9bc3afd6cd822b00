//! Span identities and the session-scoped span id allocator
//!
//! Every CPU call that enters gets a fresh [`SpanId`]. The allocator is a
//! monotonically increasing atomic counter owned by the trace session, so ids
//! are unique for the session lifetime and never reused, regardless of which
//! thread allocates them.
//!
//! # Identity Triple
//!
//! ```text
//! SpanIdentity { span_id, parent_span_id, depth }
//!
//! thread 7:  hipLaunchKernel (span=1, parent=None, depth=0)
//!            └─ hipMemcpyAsync (span=2, parent=1, depth=1)
//! device:       └─ copy lap 1   (parent=2, depth=2)
//! ```
//!
//! # Example
//!
//! ```
//! use hetrace::span_id::SpanIdAllocator;
//!
//! let alloc = SpanIdAllocator::new();
//! let a = alloc.next_id();
//! let b = alloc.next_id();
//! assert!(a < b);
//! assert_eq!(a.as_raw(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque id assigned by the vendor runtime to one CPU-side call
pub type CorrelationId = u64;

/// Unique id of one traced call instance
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct SpanId(u64);

impl SpanId {
    /// The zero id, used only by degraded identities
    pub const NONE: SpanId = SpanId(0);

    pub const fn from_raw(raw: u64) -> Self {
        SpanId(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `{span_id, parent_span_id, depth}` of one call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanIdentity {
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_span_id: Option<SpanId>,
    pub depth: u16,
}

impl SpanIdentity {
    /// Identity of a call with no enclosing call on its thread
    pub const fn root(span_id: SpanId) -> Self {
        Self {
            span_id,
            parent_span_id: None,
            depth: 0,
        }
    }

    /// Identity of a call nested directly under `parent`
    pub fn child_of(span_id: SpanId, parent: &SpanIdentity) -> Self {
        Self {
            span_id,
            parent_span_id: Some(parent.span_id),
            depth: parent.depth.saturating_add(1),
        }
    }

    /// The zero identity returned when a correlation record is missing
    pub const fn degraded() -> Self {
        Self::root(SpanId::NONE)
    }

    pub fn is_degraded(&self) -> bool {
        self.span_id == SpanId::NONE
    }
}

/// Session-scoped span id allocator
///
/// # Thread Safety
///
/// Lock-free; a single `fetch_add` per allocation. Share it by reference from
/// the owning session.
#[derive(Debug)]
pub struct SpanIdAllocator {
    counter: AtomicU64,
}

impl SpanIdAllocator {
    /// Create an allocator whose first id is 1
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Allocate the next span id
    pub fn next_id(&self) -> SpanId {
        SpanId(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Number of ids handed out so far
    pub fn allocated(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for SpanIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
