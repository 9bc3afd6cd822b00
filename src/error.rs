//! Error types for the correlation engine
//!
//! Only setup, teardown, configuration and replay failures are errors. Conditions
//! met while correlating live events (unregistered correlation ids, unsupported
//! records, clock anomalies) are recovered locally and never surface here.

use thiserror::Error;

/// Library error type
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Timestamp source unavailable: {0}")]
    TimestampUnavailable(String),

    #[error("Trace source failed to enable {domain}: {reason}")]
    EnableFailed { domain: String, reason: String },

    #[error("Trace source failed to disable {domain}: {reason}")]
    DisableFailed { domain: String, reason: String },

    #[error("Invalid operation filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session is not active")]
    Inactive,

    #[error("Replay decode error at line {line}: {reason}")]
    ReplayDecode { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias
pub type TraceResult<T> = std::result::Result<T, TraceError>;
