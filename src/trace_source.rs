//! Vendor tracing runtime capability
//!
//! The session never talks to a vendor runtime directly. It holds a
//! [`TraceSource`] that can enable or disable a tracing domain and read the
//! device clock. The vendor runtime is one implementation; [`FakeTraceSource`]
//! is the in-crate one used by tests and the replay tool.

use crate::clock_skew::{HostClock, TimestampSource};
use crate::error::{TraceError, TraceResult};
use crate::operation_filter::OperationFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

/// Callback or activity domain of the vendor runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceDomain {
    /// CPU API calls carrying a correlation id (HIP API)
    CorrelatedApi,
    /// CPU API calls without correlation (HSA API)
    UntrackedApi,
    /// Device completion records tied to correlated API calls
    DeviceActivity,
    /// Device completion records with no CPU call (HSA async copies)
    UntrackedActivity,
}

impl TraceDomain {
    pub const ALL: [TraceDomain; 4] = [
        TraceDomain::CorrelatedApi,
        TraceDomain::UntrackedApi,
        TraceDomain::DeviceActivity,
        TraceDomain::UntrackedActivity,
    ];
}

impl fmt::Display for TraceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceDomain::CorrelatedApi => "correlated_api",
            TraceDomain::UntrackedApi => "untracked_api",
            TraceDomain::DeviceActivity => "device_activity",
            TraceDomain::UntrackedActivity => "untracked_activity",
        };
        f.write_str(name)
    }
}

/// Enable/disable lifecycle plus device clock access
pub trait TraceSource: Send + Sync {
    fn name(&self) -> &str {
        "trace-source"
    }

    fn enable(&self, domain: TraceDomain, filter: &OperationFilter) -> TraceResult<()>;

    fn disable(&self, domain: TraceDomain) -> TraceResult<()>;

    /// Current device timestamp in nanoseconds
    fn device_timestamp(&self) -> TraceResult<u64>;
}

/// Adapts a source's device clock to [`TimestampSource`]
pub struct DeviceClock<'a>(pub &'a dyn TraceSource);

impl TimestampSource for DeviceClock<'_> {
    fn timestamp(&self) -> TraceResult<u64> {
        self.0.device_timestamp()
    }
}

/// One observed call on a [`FakeTraceSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCall {
    Enable(TraceDomain),
    Disable(TraceDomain),
}

#[derive(Debug, Clone, Copy)]
enum FakeClock {
    /// host clock minus an offset
    HostShifted(i64),
    Fixed(u64),
    Missing,
}

/// Scriptable [`TraceSource`] for tests
#[derive(Debug)]
pub struct FakeTraceSource {
    calls: Mutex<Vec<SourceCall>>,
    enabled: Mutex<BTreeSet<TraceDomain>>,
    fail_enable: Option<TraceDomain>,
    fail_disable: bool,
    clock: FakeClock,
}

impl Default for FakeTraceSource {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            enabled: Mutex::new(BTreeSet::new()),
            fail_enable: None,
            fail_disable: false,
            clock: FakeClock::HostShifted(0),
        }
    }
}

impl FakeTraceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device clock runs `offset` ns behind the host clock
    pub fn with_device_offset(mut self, offset: i64) -> Self {
        self.clock = FakeClock::HostShifted(offset);
        self
    }

    /// Device clock always reads `ts`
    pub fn with_fixed_device_time(mut self, ts: u64) -> Self {
        self.clock = FakeClock::Fixed(ts);
        self
    }

    /// Device clock reads fail
    pub fn without_device_clock(mut self) -> Self {
        self.clock = FakeClock::Missing;
        self
    }

    /// `enable(domain)` fails
    pub fn failing_enable(mut self, domain: TraceDomain) -> Self {
        self.fail_enable = Some(domain);
        self
    }

    /// Every `disable` fails
    pub fn failing_disable(mut self) -> Self {
        self.fail_disable = true;
        self
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn enabled(&self) -> Vec<TraceDomain> {
        self.enabled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect()
    }

    fn log(&self, call: SourceCall) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call);
    }
}

impl TraceSource for FakeTraceSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn enable(&self, domain: TraceDomain, _filter: &OperationFilter) -> TraceResult<()> {
        self.log(SourceCall::Enable(domain));
        if self.fail_enable == Some(domain) {
            return Err(TraceError::EnableFailed {
                domain: domain.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.enabled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(domain);
        Ok(())
    }

    fn disable(&self, domain: TraceDomain) -> TraceResult<()> {
        self.log(SourceCall::Disable(domain));
        if self.fail_disable {
            return Err(TraceError::DisableFailed {
                domain: domain.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.enabled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&domain);
        Ok(())
    }

    fn device_timestamp(&self) -> TraceResult<u64> {
        match self.clock {
            FakeClock::HostShifted(offset) => Ok(HostClock::now().saturating_add_signed(-offset)),
            FakeClock::Fixed(ts) => Ok(ts),
            FakeClock::Missing => Err(TraceError::TimestampUnavailable(
                "fake source has no device clock".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable_recorded() {
        let source = FakeTraceSource::new();
        let filter = OperationFilter::all();
        source.enable(TraceDomain::CorrelatedApi, &filter).unwrap();
        source.enable(TraceDomain::DeviceActivity, &filter).unwrap();
        source.disable(TraceDomain::CorrelatedApi).unwrap();

        assert_eq!(source.enabled(), vec![TraceDomain::DeviceActivity]);
        assert_eq!(
            source.calls(),
            vec![
                SourceCall::Enable(TraceDomain::CorrelatedApi),
                SourceCall::Enable(TraceDomain::DeviceActivity),
                SourceCall::Disable(TraceDomain::CorrelatedApi),
            ]
        );
    }

    #[test]
    fn test_injected_failures() {
        let source = FakeTraceSource::new()
            .failing_enable(TraceDomain::UntrackedApi)
            .failing_disable();
        let filter = OperationFilter::all();

        assert!(source.enable(TraceDomain::CorrelatedApi, &filter).is_ok());
        let err = source
            .enable(TraceDomain::UntrackedApi, &filter)
            .unwrap_err();
        assert!(err.to_string().contains("untracked_api"));
        assert!(source.disable(TraceDomain::CorrelatedApi).is_err());
    }

    #[test]
    fn test_device_clock_variants() {
        assert_eq!(
            FakeTraceSource::new()
                .with_fixed_device_time(99)
                .device_timestamp()
                .unwrap(),
            99
        );
        assert!(FakeTraceSource::new()
            .without_device_clock()
            .device_timestamp()
            .is_err());

        let source = FakeTraceSource::new().with_device_offset(1_000_000);
        let device = DeviceClock(&source).timestamp().unwrap();
        assert!(device < HostClock::now());
    }
}
