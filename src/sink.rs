//! Downstream sink interfaces
//!
//! The engine never renders or persists traces. It feeds two kinds of sink:
//!
//! - [`SpanSink`]: structured begin/end markers, perfetto style. An end marker
//!   closes the most recent open begin on the same [`Track`].
//! - [`DurationSink`]: flat `(name, duration)` samples for an aggregator.
//!
//! Both are called from arbitrary threads, including from deferred jobs, so
//! implementations must be `Send + Sync`. A sink must not call back into the
//! trace session.

use crate::config::ScopeFlags;
use crate::critical_trace::{CriticalEntry, CriticalTrace};
use crate::span_id::{CorrelationId, SpanIdentity};
use crate::span_record::{SpanKind, SpanRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Timeline lane a marker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Host thread (CPU spans)
    Thread(u64),
    /// Device queue (device spans)
    Device { device_id: u32, queue_id: u64 },
}

/// Payload of a begin marker
#[derive(Debug, Clone, PartialEq)]
pub struct SpanBegin {
    pub name: String,
    pub kind: SpanKind,
    pub track: Track,
    pub timestamp_ns: u64,
    pub identity: SpanIdentity,
    pub thread_id: u64,
    pub correlation_id: Option<CorrelationId>,
    pub lap: Option<u32>,
    pub attributes: BTreeMap<String, String>,
}

impl SpanBegin {
    /// Finish into a record using `end_ns`
    pub fn finish(self, end_ns: u64) -> SpanRecord {
        let mut record = SpanRecord::cpu(
            self.name,
            self.identity,
            self.timestamp_ns,
            end_ns,
            self.thread_id,
        );
        if let Track::Device {
            device_id,
            queue_id,
        } = self.track
        {
            record.device_id = Some(device_id);
            record.queue_id = Some(queue_id);
        }
        record.kind = self.kind;
        record.correlation_id = self.correlation_id;
        record.lap = self.lap;
        record.attributes = self.attributes;
        record
    }
}

/// Structured span emission
pub trait SpanSink: Send + Sync {
    fn begin_span(&self, begin: SpanBegin);

    fn end_span(&self, track: Track, timestamp_ns: u64);

    /// Drop the most recent open begin on `track` without emitting it
    fn discard_span(&self, _track: Track) {}

    /// Begin and end in one call; sinks shared across threads override this to
    /// keep the pair from interleaving with another writer on the same track
    fn complete_span(&self, begin: SpanBegin, end_ns: u64) {
        let track = begin.track;
        self.begin_span(begin);
        self.end_span(track, end_ns);
    }
}

/// Aggregated duration emission
pub trait DurationSink: Send + Sync {
    fn record_duration(&self, name: &str, duration_ns: u64, scope: ScopeFlags);
}

impl<T: SpanSink + ?Sized> SpanSink for Arc<T> {
    fn begin_span(&self, begin: SpanBegin) {
        (**self).begin_span(begin)
    }

    fn end_span(&self, track: Track, timestamp_ns: u64) {
        (**self).end_span(track, timestamp_ns)
    }

    fn discard_span(&self, track: Track) {
        (**self).discard_span(track)
    }

    fn complete_span(&self, begin: SpanBegin, end_ns: u64) {
        (**self).complete_span(begin, end_ns)
    }
}

impl<T: DurationSink + ?Sized> DurationSink for Arc<T> {
    fn record_duration(&self, name: &str, duration_ns: u64, scope: ScopeFlags) {
        (**self).record_duration(name, duration_ns, scope)
    }
}

/// Forwards every marker to several span sinks in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SpanSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn SpanSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SpanSink for FanoutSink {
    fn begin_span(&self, begin: SpanBegin) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.begin_span(begin.clone());
            }
            last.begin_span(begin);
        }
    }

    fn end_span(&self, track: Track, timestamp_ns: u64) {
        for sink in &self.sinks {
            sink.end_span(track, timestamp_ns);
        }
    }

    fn discard_span(&self, track: Track) {
        for sink in &self.sinks {
            sink.discard_span(track);
        }
    }

    fn complete_span(&self, begin: SpanBegin, end_ns: u64) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.complete_span(begin.clone(), end_ns);
            }
            last.complete_span(begin, end_ns);
        }
    }
}

/// The sinks a session feeds; absent sinks are skipped
#[derive(Clone, Default)]
pub struct SinkSet {
    pub spans: Option<Arc<dyn SpanSink>>,
    pub durations: Option<Arc<dyn DurationSink>>,
    pub critical: Option<Arc<CriticalTrace>>,
    pub scope: ScopeFlags,
}

impl SinkSet {
    pub fn begin_span(&self, begin: SpanBegin) {
        if let Some(spans) = &self.spans {
            spans.begin_span(begin);
        }
    }

    pub fn end_span(&self, track: Track, timestamp_ns: u64) {
        if let Some(spans) = &self.spans {
            spans.end_span(track, timestamp_ns);
        }
    }

    pub fn discard_span(&self, track: Track) {
        if let Some(spans) = &self.spans {
            spans.discard_span(track);
        }
    }

    pub fn complete_span(&self, begin: SpanBegin, end_ns: u64) {
        if let Some(spans) = &self.spans {
            spans.complete_span(begin, end_ns);
        }
    }

    pub fn record_duration(&self, name: &str, duration_ns: u64) {
        if let Some(durations) = &self.durations {
            durations.record_duration(name, duration_ns, self.scope);
        }
    }

    pub fn critical(&self, name: &str, entry: CriticalEntry) {
        if let Some(critical) = &self.critical {
            critical.push(name, entry);
        }
    }
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet")
            .field("spans", &self.spans.is_some())
            .field("durations", &self.durations.is_some())
            .field("critical", &self.critical.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}
