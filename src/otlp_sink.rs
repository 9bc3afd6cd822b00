//! OpenTelemetry OTLP span sink
//!
//! Forwards every finished span (CPU and device) to an OTLP endpoint such as
//! Jaeger or Tempo. Begin markers are held per track until their end marker
//! arrives; the exported span carries the original begin/end timestamps and
//! the correlation attributes.
//!
//! # Example
//!
//! ```bash
//! hetrace replay trace.jsonl --otlp-endpoint http://localhost:4317
//! ```

use crate::sink::{SpanBegin, SpanSink, Track};
#[cfg(feature = "otlp")]
use crate::span_record::SpanRecord;
use anyhow::Result;
#[cfg(feature = "otlp")]
use opentelemetry::{
    trace::{Span, SpanKind as OtelSpanKind, Tracer, TracerProvider as _},
    KeyValue,
};
#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    trace::{BatchSpanProcessor, SdkTracerProvider as TracerProvider},
    Resource,
};
#[cfg(feature = "otlp")]
use std::collections::HashMap;
#[cfg(feature = "otlp")]
use std::sync::Mutex;
#[cfg(feature = "otlp")]
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Configuration for the OTLP sink
#[derive(Debug, Clone)]
pub struct OtlpConfig {
    /// OTLP endpoint URL (e.g., "http://localhost:4317")
    pub endpoint: String,
    /// Service name for traces
    pub service_name: String,
}

/// Span sink exporting over OTLP
#[cfg(feature = "otlp")]
pub struct OtlpSink {
    _runtime: tokio::runtime::Runtime, // Tokio runtime for async OTLP operations
    provider: TracerProvider,
    tracer: opentelemetry_sdk::trace::Tracer,
    open: Mutex<HashMap<Track, Vec<SpanBegin>>>,
}

#[cfg(feature = "otlp")]
impl OtlpSink {
    pub fn new(config: OtlpConfig) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| anyhow::anyhow!("Failed to create Tokio runtime: {}", e))?;

        let (provider, tracer) = runtime.block_on(async {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(&config.endpoint)
                .build()?;

            let span_processor = BatchSpanProcessor::builder(exporter).build();

            let resource = Resource::builder()
                .with_service_name(config.service_name.clone())
                .with_attributes(vec![KeyValue::new("trace.kind", "heterogeneous")])
                .build();

            let provider = TracerProvider::builder()
                .with_span_processor(span_processor)
                .with_resource(resource)
                .build();

            let tracer = provider.tracer("hetrace");

            Ok::<_, anyhow::Error>((provider, tracer))
        })?;

        tracing::info!(endpoint = %config.endpoint, "OTLP span sink ready");
        Ok(OtlpSink {
            _runtime: runtime,
            provider,
            tracer,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Export one finished span
    pub fn export(&self, record: &SpanRecord) {
        let mut attributes = vec![
            KeyValue::new("span.kind", format!("{:?}", record.kind).to_lowercase()),
            KeyValue::new("span.id", record.span_id.as_raw() as i64),
            KeyValue::new("span.depth", record.depth as i64),
            KeyValue::new("thread.id", record.thread_id as i64),
        ];
        if let Some(parent) = record.parent_span_id {
            attributes.push(KeyValue::new("span.parent_id", parent.as_raw() as i64));
        }
        if let Some(cid) = record.correlation_id {
            attributes.push(KeyValue::new("correlation.id", cid as i64));
        }
        if let Some(lap) = record.lap {
            attributes.push(KeyValue::new("device.lap", lap as i64));
        }
        if let Some(device) = record.device_id {
            attributes.push(KeyValue::new("device.id", device as i64));
        }
        if let Some(queue) = record.queue_id {
            attributes.push(KeyValue::new("device.queue", queue as i64));
        }
        for (key, value) in &record.attributes {
            attributes.push(KeyValue::new(format!("hetrace.{}", key), value.clone()));
        }

        let mut span = self
            .tracer
            .span_builder(record.name.clone())
            .with_kind(OtelSpanKind::Internal)
            .with_start_time(to_system_time(record.begin_ns))
            .with_attributes(attributes)
            .start(&self.tracer);
        span.end_with_timestamp(to_system_time(record.end_ns));
    }

    /// Flush buffered spans and stop the exporter
    pub fn shutdown(&self) {
        let unfinished: usize = self
            .open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, stack)| stack.len())
            .sum();
        if unfinished > 0 {
            tracing::debug!(unfinished, "unfinished spans not exported");
        }
        if let Err(err) = self.provider.force_flush() {
            tracing::warn!("OTLP flush failed: {}", err);
        }
        if let Err(err) = self.provider.shutdown() {
            tracing::debug!("OTLP shutdown: {}", err);
        }
    }
}

#[cfg(feature = "otlp")]
fn to_system_time(ns: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns)
}

#[cfg(feature = "otlp")]
impl SpanSink for OtlpSink {
    fn begin_span(&self, begin: SpanBegin) {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(begin.track)
            .or_default()
            .push(begin);
    }

    fn end_span(&self, track: Track, timestamp_ns: u64) {
        let begin = {
            let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            open.get_mut(&track).and_then(Vec::pop)
        };
        if let Some(begin) = begin {
            self.export(&begin.finish(timestamp_ns));
        }
    }

    fn discard_span(&self, track: Track) {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(stack) = open.get_mut(&track) {
            stack.pop();
        }
    }

    fn complete_span(&self, begin: SpanBegin, end_ns: u64) {
        self.export(&begin.finish(end_ns));
    }
}

#[cfg(feature = "otlp")]
impl std::fmt::Debug for OtlpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtlpSink").finish_non_exhaustive()
    }
}

// Stub implementation when OTLP feature is disabled
#[cfg(not(feature = "otlp"))]
#[derive(Debug)]
pub struct OtlpSink;

#[cfg(not(feature = "otlp"))]
impl OtlpSink {
    pub fn new(_config: OtlpConfig) -> Result<Self> {
        anyhow::bail!("OTLP support not compiled in. Enable the 'otlp' feature.");
    }

    pub fn shutdown(&self) {}
}

#[cfg(not(feature = "otlp"))]
impl SpanSink for OtlpSink {
    fn begin_span(&self, _begin: SpanBegin) {}

    fn end_span(&self, _track: Track, _timestamp_ns: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "otlp")]
    fn test_timestamp_conversion() {
        let t = to_system_time(1_500_000_000);
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    #[cfg(not(feature = "otlp"))]
    fn test_otlp_disabled_returns_error() {
        let config = OtlpConfig {
            endpoint: "http://localhost:4317".to_string(),
            service_name: "test".to_string(),
        };

        let result = OtlpSink::new(config);
        assert!(result.is_err());
    }
}
