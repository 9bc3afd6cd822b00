//! Device-to-host clock skew estimation
//!
//! Device completion records carry timestamps from the device clock. Before a
//! device span can be compared with host spans, an additive offset is applied:
//!
//! ```text
//! host_ts ≈ device_ts + offset
//! ```
//!
//! # Algorithm
//!
//! A single (host, device) pair cannot be trusted: reading the device clock has
//! unbounded host-side latency. Each iteration therefore brackets one device
//! read between two host reads and assumes the device read happened at the
//! host midpoint:
//!
//! ```text
//! fence; h0 = host()
//! fence; d  = device()
//! fence; h1 = host()
//! offset_i = (h0/2 + h1/2) - d
//! offset   = mean(offset_i)   over N iterations (default 10)
//! ```
//!
//! The result is computed lazily on first use and cached for the lifetime of the
//! estimator. Later drift never triggers recalibration. If a timestamp source
//! fails, the offset is 0 and one warning is logged.

use crate::error::TraceResult;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// A clock that can be read in nanoseconds
pub trait TimestampSource: Send + Sync {
    fn timestamp(&self) -> TraceResult<u64>;
}

/// Host wall clock, nanoseconds since the UNIX epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct HostClock;

impl TimestampSource for HostClock {
    fn timestamp(&self) -> TraceResult<u64> {
        Ok(HostClock::now())
    }
}

impl HostClock {
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Outcome of one calibration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewCalibration {
    /// Mean `host - device` offset in nanoseconds
    pub offset: i64,
    pub host_average: u64,
    pub device_average: u64,
    pub iterations: u32,
}

/// Lazily calibrated, cached clock offset
#[derive(Debug)]
pub struct ClockSkew {
    iterations: u32,
    enabled: bool,
    calibration: OnceLock<Option<SkewCalibration>>,
    warned: AtomicBool,
}

impl ClockSkew {
    /// Estimator that calibrates on first use
    ///
    /// When `enabled` is false the calibration still runs (and is logged) but the
    /// applied offset is always 0.
    pub fn new(iterations: u32, enabled: bool) -> Self {
        Self {
            iterations: iterations.max(1),
            enabled,
            calibration: OnceLock::new(),
            warned: AtomicBool::new(false),
        }
    }

    /// Estimator with a known offset; never touches a clock
    pub fn fixed(offset: i64) -> Self {
        let skew = Self::new(1, true);
        let _ = skew.calibration.set(Some(SkewCalibration {
            offset,
            host_average: 0,
            device_average: 0,
            iterations: 0,
        }));
        skew
    }

    /// Offset to add to device timestamps, calibrating on first call
    pub fn offset(&self, host: &dyn TimestampSource, device: &dyn TimestampSource) -> i64 {
        let calibration = self
            .calibration
            .get_or_init(|| match estimate_skew(host, device, self.iterations) {
                Ok(calibration) => {
                    tracing::debug!(
                        host_average = calibration.host_average,
                        device_average = calibration.device_average,
                        offset = calibration.offset,
                        used = self.enabled,
                        "host/device timestamp skew calibrated"
                    );
                    Some(calibration)
                }
                Err(err) => {
                    if !self.warned.swap(true, Ordering::SeqCst) {
                        tracing::warn!("clock skew unavailable, using offset 0: {}", err);
                    }
                    None
                }
            });

        match calibration {
            Some(c) if self.enabled => c.offset,
            _ => 0,
        }
    }

    /// The cached calibration, if one has run successfully
    pub fn calibration(&self) -> Option<SkewCalibration> {
        self.calibration.get().copied().flatten()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.get().is_some()
    }

    /// Shift a device timestamp by the cached offset (0 before calibration)
    pub fn apply(&self, device_ts: u64) -> u64 {
        let offset = match self.calibration.get() {
            Some(Some(c)) if self.enabled => c.offset,
            _ => 0,
        };
        apply_skew(device_ts, offset)
    }
}

/// Convert a device timestamp to host time
pub fn apply_skew(device_ts: u64, offset: i64) -> u64 {
    device_ts.saturating_add_signed(offset)
}

/// Run the bracketed calibration loop
///
/// # Errors
///
/// Returns the first error from either timestamp source.
pub fn estimate_skew(
    host: &dyn TimestampSource,
    device: &dyn TimestampSource,
    iterations: u32,
) -> TraceResult<SkewCalibration> {
    let host_now = || {
        fence(Ordering::SeqCst);
        host.timestamp()
    };
    let device_now = || {
        fence(Ordering::SeqCst);
        device.timestamp()
    };

    // warm up caches and any lazy initialization in either source
    host_now()?;
    device_now()?;

    // epoch host stamps against a boot-relative device clock overflow an i64
    // sum within a few iterations
    let n = i128::from(iterations.max(1));
    let mut diff: i128 = 0;
    let mut host_sum: i128 = 0;
    let mut device_sum: i128 = 0;

    for _ in 0..n {
        let mut host_ts = host_now()? / 2;
        let device_ts = device_now()?;
        host_ts += host_now()? / 2;

        diff += i128::from(host_ts) - i128::from(device_ts);
        host_sum += i128::from(host_ts);
        device_sum += i128::from(device_ts);
    }

    let offset = (diff / n).clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
    Ok(SkewCalibration {
        offset,
        host_average: (host_sum / n) as u64,
        device_average: (device_sum / n) as u64,
        iterations: iterations.max(1),
    })
}
