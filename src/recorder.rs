//! In-memory span recorder
//!
//! A [`SpanSink`] that pairs begin/end markers per track and keeps the finished
//! [`SpanRecord`]s. Used by tests and the replay tool; JSON export mirrors the
//! span record schema.

use crate::sink::{SpanBegin, SpanSink, Track};
use crate::span_record::{SpanKind, SpanRecord};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Recorder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub finished: usize,
    pub open: usize,
    pub discarded: u64,
    /// End markers with no open begin on their track
    pub unmatched_ends: u64,
}

/// Collects finished spans in arrival order
#[derive(Debug, Default)]
pub struct TraceRecorder {
    open: Mutex<HashMap<Track, Vec<SpanBegin>>>,
    finished: Mutex<Vec<SpanRecord>>,
    discarded: AtomicU64,
    unmatched_ends: AtomicU64,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the finished spans
    pub fn records(&self) -> Vec<SpanRecord> {
        self.finished
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Finished spans of one kind
    pub fn records_of(&self, kind: SpanKind) -> Vec<SpanRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect()
    }

    /// Remove and return every finished span
    pub fn take(&self) -> Vec<SpanRecord> {
        std::mem::take(&mut *self.finished.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.finished
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RecorderStats {
        let open = self
            .open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(Vec::len)
            .sum();
        RecorderStats {
            finished: self.len(),
            open,
            discarded: self.discarded.load(Ordering::Relaxed),
            unmatched_ends: self.unmatched_ends.load(Ordering::Relaxed),
        }
    }

    /// Finished spans as a pretty JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records())
    }

    /// Write finished spans as JSON lines
    pub fn write_json_lines<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        for record in self.records() {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn pop_open(&self, track: Track) -> Option<SpanBegin> {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        let stack = open.get_mut(&track)?;
        let begin = stack.pop();
        if stack.is_empty() {
            open.remove(&track);
        }
        begin
    }
}

impl SpanSink for TraceRecorder {
    fn begin_span(&self, begin: SpanBegin) {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(begin.track)
            .or_default()
            .push(begin);
    }

    fn end_span(&self, track: Track, timestamp_ns: u64) {
        match self.pop_open(track) {
            Some(begin) => {
                let record = begin.finish(timestamp_ns);
                self.finished
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(record);
            }
            None => {
                self.unmatched_ends.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?track, "end marker without open span");
            }
        }
    }

    fn discard_span(&self, track: Track) {
        if self.pop_open(track).is_some() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn complete_span(&self, begin: SpanBegin, end_ns: u64) {
        let record = begin.finish(end_ns);
        self.finished
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }
}
