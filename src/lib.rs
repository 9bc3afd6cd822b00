//! hetrace - heterogeneous CPU/GPU trace correlation engine
//!
//! This library correlates host-side API calls with the device operations they
//! launch. CPU enter/exit callbacks open and close spans on a per-thread call
//! stack and register each call under its correlation id; device activity
//! batches are drained later, looked up by correlation id and emitted as child
//! spans of the launching call, with clock skew applied and repeated device
//! operations ("laps") ordered by ordinal.

pub mod aggregator;
pub mod cli;
pub mod clock_skew;
pub mod config;
pub mod correlation;
pub mod cpu_handler;
pub mod critical_path;
pub mod critical_trace;
pub mod device_drainer;
pub mod dispatcher;
pub mod error;
pub mod operation_filter;
pub mod otlp_sink;
pub mod recorder;
pub mod replay;
pub mod session;
pub mod sink;
pub mod span_id;
pub mod span_record;
pub mod thread_context;
pub mod trace_source;

pub use error::{TraceError, TraceResult};
pub use session::{TraceSession, TraceSessionBuilder};
