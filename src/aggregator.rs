//! Duration aggregation sink
//!
//! Accumulates `record_duration` samples per name. With the timeline scope every
//! sample becomes its own entry; otherwise samples with the same name merge.

use crate::config::ScopeFlags;
use crate::sink::DurationSink;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Statistics for one aggregated name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationStats {
    pub count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl Default for DurationStats {
    fn default() -> Self {
        Self {
            count: 0,
            total_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
        }
    }
}

impl DurationStats {
    fn add(&mut self, duration_ns: u64) {
        self.count += 1;
        self.total_ns = self.total_ns.saturating_add(duration_ns);
        self.min_ns = self.min_ns.min(duration_ns);
        self.max_ns = self.max_ns.max(duration_ns);
    }

    pub fn mean_ns(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ns as f64 / self.count as f64
        }
    }
}

/// Thread-safe per-name duration accumulator
#[derive(Debug, Default)]
pub struct DurationAggregator {
    entries: Mutex<HashMap<String, DurationStats>>,
    timeline_seq: AtomicU64,
    flat_samples: AtomicU64,
}

impl DurationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<DurationStats> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .copied()
    }

    /// Entries sorted by total time, largest first
    pub fn entries(&self) -> Vec<(String, DurationStats)> {
        let mut sorted: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        sorted.sort_by(|a, b| b.1.total_ns.cmp(&a.1.total_ns).then_with(|| a.0.cmp(&b.0)));
        sorted
    }

    /// Samples recorded with the flat scope
    pub fn flat_samples(&self) -> u64 {
        self.flat_samples.load(Ordering::Relaxed)
    }

    /// Fixed-width table, one line per entry
    pub fn summary(&self) -> String {
        let entries = self.entries();
        if entries.is_empty() {
            return "No durations recorded.\n".to_string();
        }

        let grand_total: u64 = entries.iter().map(|(_, s)| s.total_ns).sum();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "% time    total(ms)    mean(us)     min(us)     max(us)     calls name"
        );
        let _ = writeln!(
            out,
            "------ ------------ ----------- ----------- ----------- --------- ----------------"
        );
        for (name, stats) in &entries {
            let percent = if grand_total > 0 {
                stats.total_ns as f64 / grand_total as f64 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "{:6.2} {:>12.3} {:>11.3} {:>11.3} {:>11.3} {:>9} {}",
                percent,
                stats.total_ns as f64 / 1_000_000.0,
                stats.mean_ns() / 1_000.0,
                stats.min_ns as f64 / 1_000.0,
                stats.max_ns as f64 / 1_000.0,
                stats.count,
                name
            );
        }
        out
    }
}

impl DurationSink for DurationAggregator {
    fn record_duration(&self, name: &str, duration_ns: u64, scope: ScopeFlags) {
        if scope.flat {
            self.flat_samples.fetch_add(1, Ordering::Relaxed);
        }
        let key = if scope.timeline {
            let seq = self.timeline_seq.fetch_add(1, Ordering::Relaxed);
            format!("{} [{}]", name, seq)
        } else {
            name.to_string()
        };

        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key)
            .or_default()
            .add(duration_ns);
    }
}
