//! Session configuration
//!
//! A [`TraceConfig`] is built from defaults, optionally a TOML file, and finally
//! `HETRACE_*` environment overrides (environment wins).
//!
//! # Example
//! ```
//! use hetrace::config::{LapRetention, TraceConfig};
//!
//! let config = TraceConfig::from_toml_str(r#"
//!     worker_threads = 2
//!     lap_retention = { bounded = { max_entries = 1024 } }
//! "#).unwrap();
//! assert_eq!(config.worker_threads, 2);
//! assert_eq!(config.lap_retention, LapRetention::Bounded { max_entries: 1024 });
//! assert!(config.use_clock_skew);
//! ```

use crate::error::{TraceError, TraceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable names
pub const ENV_USE_CLOCK_SKEW: &str = "HETRACE_USE_CLOCK_SKEW";
pub const ENV_SKEW_ITERATIONS: &str = "HETRACE_SKEW_ITERATIONS";
pub const ENV_WORKER_THREADS: &str = "HETRACE_WORKER_THREADS";
pub const ENV_TIMELINE_PROFILE: &str = "HETRACE_TIMELINE_PROFILE";
pub const ENV_FLAT_PROFILE: &str = "HETRACE_FLAT_PROFILE";
pub const ENV_API_FILTER: &str = "HETRACE_API_FILTER";
pub const ENV_LAP_RETENTION: &str = "HETRACE_LAP_RETENTION";

/// Retention policy for per-correlation lap counters
///
/// The runtime reuses correlation ids across unrelated operations over a long
/// process, so an unbounded counter map grows with every distinct id seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LapRetention {
    /// Keep every counter for the session lifetime
    #[default]
    Unbounded,
    /// Keep at most `max_entries` counters, evicting the oldest-inserted first
    Bounded { max_entries: usize },
}

/// How aggregated durations are scoped by the aggregation sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScopeFlags {
    /// Every record is a distinct entry (no merging by name)
    pub timeline: bool,
    /// Entries are not nested under their caller
    pub flat: bool,
}

/// Configuration for a trace session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Apply the device-to-host clock offset to device timestamps
    pub use_clock_skew: bool,
    /// Number of bracketed host/device reads used to estimate skew
    pub skew_iterations: u32,
    /// Deferred work pool size (0 = run deferred work at flush points)
    pub worker_threads: usize,
    /// Pending deferred jobs above which a single warning is logged
    pub queue_warn_threshold: usize,
    /// Lap counter eviction policy
    pub lap_retention: LapRetention,
    pub timeline_profile: bool,
    pub flat_profile: bool,
    /// Emit begin/end markers to the structured span sink
    pub use_visualization: bool,
    /// Emit durations to the aggregation sink
    pub use_aggregation: bool,
    /// Collect critical-trace entries for span forest assembly
    pub use_critical_trace: bool,
    /// Filter expression for CPU API operations (e.g. `exclude=hipGetDevice`)
    pub api_filter: Option<String>,
    /// Filter expression for device operation names (e.g. `trace=COPY,BARRIER`)
    pub activity_filter: Option<String>,
    /// Skip the built-in list of noisy/unsafe API operations
    pub default_api_exclusions: bool,
    /// Block sampling signals on threads that drain device activity
    pub block_signals_on_drain: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            use_clock_skew: true,
            skew_iterations: 10,
            worker_threads: 0,
            queue_warn_threshold: 65_536,
            lap_retention: LapRetention::Unbounded,
            timeline_profile: false,
            flat_profile: false,
            use_visualization: true,
            use_aggregation: true,
            use_critical_trace: true,
            api_filter: None,
            activity_filter: None,
            default_api_exclusions: true,
            block_signals_on_drain: true,
        }
    }
}

impl TraceConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> TraceResult<Self> {
        let config: TraceConfig =
            toml::from_str(content).map_err(|e| TraceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file(path: &Path) -> TraceResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by the environment
    pub fn from_env() -> TraceResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `HETRACE_*` overrides on top of this configuration
    pub fn with_env_overrides(mut self) -> TraceResult<Self> {
        if let Some(v) = env_flag(ENV_USE_CLOCK_SKEW)? {
            self.use_clock_skew = v;
        }
        if let Some(v) = env_number(ENV_SKEW_ITERATIONS)? {
            self.skew_iterations = v as u32;
        }
        if let Some(v) = env_number(ENV_WORKER_THREADS)? {
            self.worker_threads = v as usize;
        }
        if let Some(v) = env_flag(ENV_TIMELINE_PROFILE)? {
            self.timeline_profile = v;
        }
        if let Some(v) = env_flag(ENV_FLAT_PROFILE)? {
            self.flat_profile = v;
        }
        if let Ok(expr) = std::env::var(ENV_API_FILTER) {
            if !expr.trim().is_empty() {
                self.api_filter = Some(expr);
            }
        }
        if let Some(v) = env_number(ENV_LAP_RETENTION)? {
            self.lap_retention = if v == 0 {
                LapRetention::Unbounded
            } else {
                LapRetention::Bounded {
                    max_entries: v as usize,
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Aggregation scope derived from the profile flags
    pub fn scope_flags(&self) -> ScopeFlags {
        ScopeFlags {
            timeline: self.timeline_profile,
            flat: self.flat_profile,
        }
    }

    fn validate(&self) -> TraceResult<()> {
        if self.skew_iterations == 0 {
            return Err(TraceError::Config(
                "skew_iterations must be >= 1".to_string(),
            ));
        }
        if let LapRetention::Bounded { max_entries: 0 } = self.lap_retention {
            return Err(TraceError::Config(
                "bounded lap retention needs max_entries >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> TraceResult<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(TraceError::Config(format!(
            "{} expects a boolean, got '{}'",
            name, other
        ))),
    }
}

fn env_number(name: &str) -> TraceResult<Option<u64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| TraceError::Config(format!("{} expects an integer, got '{}'", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            ENV_USE_CLOCK_SKEW,
            ENV_SKEW_ITERATIONS,
            ENV_WORKER_THREADS,
            ENV_TIMELINE_PROFILE,
            ENV_FLAT_PROFILE,
            ENV_API_FILTER,
            ENV_LAP_RETENTION,
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = TraceConfig::default();
        assert!(config.use_clock_skew);
        assert_eq!(config.skew_iterations, 10);
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.lap_retention, LapRetention::Unbounded);
        assert!(config.use_visualization);
        assert!(config.use_aggregation);
        assert!(config.use_critical_trace);
        assert!(config.default_api_exclusions);
    }

    #[test]
    fn test_toml_partial_document() {
        let config = TraceConfig::from_toml_str(
            r#"
            use_clock_skew = false
            timeline_profile = true
            api_filter = "trace=hipLaunchKernel"
            "#,
        )
        .unwrap();

        assert!(!config.use_clock_skew);
        assert!(config.scope_flags().timeline);
        assert!(!config.scope_flags().flat);
        assert_eq!(config.api_filter.as_deref(), Some("trace=hipLaunchKernel"));
        assert_eq!(config.skew_iterations, 10);
    }

    #[test]
    fn test_toml_rejects_zero_iterations() {
        let result = TraceConfig::from_toml_str("skew_iterations = 0");
        assert!(matches!(result, Err(TraceError::Config(_))));
    }

    #[test]
    fn test_toml_rejects_empty_bounded_retention() {
        let result =
            TraceConfig::from_toml_str("lap_retention = { bounded = { max_entries = 0 } }");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(ENV_USE_CLOCK_SKEW, "off");
        std::env::set_var(ENV_WORKER_THREADS, "4");
        std::env::set_var(ENV_LAP_RETENTION, "256");

        let config = TraceConfig::from_env().unwrap();
        assert!(!config.use_clock_skew);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(
            config.lap_retention,
            LapRetention::Bounded { max_entries: 256 }
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_invalid_flag() {
        clear_env();
        std::env::set_var(ENV_USE_CLOCK_SKEW, "maybe");

        let result = TraceConfig::from_env();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("expects a boolean"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_absent_keeps_file_values() {
        clear_env();
        let config = TraceConfig::from_toml_str("worker_threads = 3")
            .unwrap()
            .with_env_overrides()
            .unwrap();
        assert_eq!(config.worker_threads, 3);
    }
}
