//! Emitted span schema
//!
//! A [`SpanRecord`] is one finished unit of traced work as handed to sinks and
//! stored by the in-memory recorder. There are two flavors:
//!
//! - **CPU spans**: one per intercepted API call, timestamps on the host clock.
//! - **Device spans**: one per device completion record, timestamps converted to
//!   the host clock with the session's clock skew, logically a child of the CPU
//!   call that launched them (one extra depth level).
//!
//! ```text
//! SpanRecord
//! ├─ name: String
//! ├─ kind: Cpu | Device
//! ├─ begin_ns / end_ns / duration_ns: u64   (host clock)
//! ├─ span_id, parent_span_id, depth         (causal position)
//! ├─ thread_id: u64                         (owning host thread)
//! ├─ correlation_id, lap                    (device spans: which launch, which lap)
//! └─ device_id, queue_id                    (device spans only)
//! ```

use crate::span_id::{CorrelationId, SpanId, SpanIdentity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which side of the heterogeneous program produced the span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Host-side API call
    #[default]
    Cpu,
    /// Device-side operation (dispatch, copy, barrier)
    Device,
}

/// One finished span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
    pub name: String,
    pub kind: SpanKind,
    pub begin_ns: u64,
    pub end_ns: u64,
    /// `end_ns - begin_ns`, stored for query convenience
    pub duration_ns: u64,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_span_id: Option<SpanId>,
    pub depth: u16,
    pub thread_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<CorrelationId>,
    /// 1-based ordinal among device records sharing one correlation id
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lap: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub queue_id: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<String, String>,
}

impl SpanRecord {
    /// Build a CPU span from its identity and host timestamps
    ///
    /// # Example
    ///
    /// ```
    /// use hetrace::span_id::{SpanId, SpanIdentity};
    /// use hetrace::span_record::{SpanKind, SpanRecord};
    ///
    /// let span = SpanRecord::cpu("hipMemcpy", SpanIdentity::root(SpanId::from_raw(1)), 100, 250, 7);
    /// assert_eq!(span.kind, SpanKind::Cpu);
    /// assert_eq!(span.duration_ns, 150);
    /// assert!(span.is_root());
    /// ```
    pub fn cpu(
        name: impl Into<String>,
        identity: SpanIdentity,
        begin_ns: u64,
        end_ns: u64,
        thread_id: u64,
    ) -> Self {
        Self {
            name: name.into(),
            kind: SpanKind::Cpu,
            begin_ns,
            end_ns,
            duration_ns: end_ns.saturating_sub(begin_ns),
            span_id: identity.span_id,
            parent_span_id: identity.parent_span_id,
            depth: identity.depth,
            thread_id,
            correlation_id: None,
            lap: None,
            device_id: None,
            queue_id: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Build a device span; `parent` is the launching CPU call, if known
    ///
    /// A device span with a parent sits one level below it. Without a parent it
    /// is an orphan at depth 0.
    #[allow(clippy::too_many_arguments)]
    pub fn device(
        name: impl Into<String>,
        parent: Option<SpanIdentity>,
        begin_ns: u64,
        end_ns: u64,
        thread_id: u64,
        correlation_id: CorrelationId,
        lap: u32,
        device_id: u32,
        queue_id: u64,
    ) -> Self {
        let (span_id, parent_span_id, depth) = match parent {
            Some(cpu) => (cpu.span_id, Some(cpu.span_id), cpu.depth.saturating_add(1)),
            None => (SpanId::NONE, None, 0),
        };
        Self {
            name: name.into(),
            kind: SpanKind::Device,
            begin_ns,
            end_ns,
            duration_ns: end_ns.saturating_sub(begin_ns),
            span_id,
            parent_span_id,
            depth,
            thread_id,
            correlation_id: Some(correlation_id),
            lap: Some(lap),
            device_id: Some(device_id),
            queue_id: Some(queue_id),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// No resolvable parent
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Device span whose correlation record was absent or already closed
    pub fn is_orphan(&self) -> bool {
        self.kind == SpanKind::Device && self.parent_span_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_span_creation() {
        let parent = SpanIdentity::root(SpanId::from_raw(1));
        let identity = SpanIdentity::child_of(SpanId::from_raw(2), &parent);
        let span = SpanRecord::cpu("hipMemcpyAsync", identity, 1000, 3500, 7);

        assert_eq!(span.name, "hipMemcpyAsync");
        assert_eq!(span.kind, SpanKind::Cpu);
        assert_eq!(span.duration_ns, 2500);
        assert_eq!(span.span_id, SpanId::from_raw(2));
        assert_eq!(span.parent_span_id, Some(SpanId::from_raw(1)));
        assert_eq!(span.depth, 1);
        assert_eq!(span.thread_id, 7);
        assert!(!span.is_root());
        assert!(!span.is_orphan());
    }

    #[test]
    fn test_device_span_links_to_cpu_parent() {
        let cpu = SpanIdentity::root(SpanId::from_raw(1));
        let span = SpanRecord::device("vector_add", Some(cpu), 40, 70, 7, 42, 1, 0, 3);

        assert_eq!(span.kind, SpanKind::Device);
        assert_eq!(span.parent_span_id, Some(SpanId::from_raw(1)));
        assert_eq!(span.depth, 1);
        assert_eq!(span.lap, Some(1));
        assert_eq!(span.correlation_id, Some(42));
        assert_eq!(span.queue_id, Some(3));
        assert!(!span.is_orphan());
    }

    #[test]
    fn test_orphan_device_span() {
        let span = SpanRecord::device("COPY", None, 10, 20, 0, 99, 3, 1, 0);

        assert!(span.is_orphan());
        assert_eq!(span.depth, 0);
        assert_eq!(span.span_id, SpanId::NONE);
    }

    #[test]
    fn test_duration_never_underflows() {
        let span = SpanRecord::cpu("x", SpanIdentity::degraded(), 500, 100, 0);
        assert_eq!(span.duration_ns, 0);
    }

    #[test]
    fn test_json_shape() {
        let span = SpanRecord::cpu("hipFree", SpanIdentity::root(SpanId::from_raw(9)), 1, 2, 3)
            .with_attribute("queue", 17);
        let json = serde_json::to_value(&span).unwrap();

        assert_eq!(json["kind"], "cpu");
        assert_eq!(json["span_id"], 9);
        assert_eq!(json["attributes"]["queue"], "17");
        assert!(json.get("parent_span_id").is_none());
        assert!(json.get("lap").is_none());

        let back: SpanRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, span);
    }
}
