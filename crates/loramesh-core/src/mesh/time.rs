//! Logical simulation clock
//!
//! The engine never reads a wall clock. Every operation receives the
//! current [`SimTime`] from whoever drives it (the discrete-event
//! simulator, a test, or a hardware bridge), which keeps every run
//! reproducible. Spans are plain [`std::time::Duration`] values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// Simulated timestamp with microsecond resolution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SimTime(u64);

impl SimTime {
    /// Start of the simulation.
    pub const ZERO: SimTime = SimTime(0);

    /// Latest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Smallest step the clock can represent.
    pub const RESOLUTION: Duration = Duration::from_micros(1);

    pub const fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms.saturating_mul(1_000))
    }

    pub const fn from_secs(secs: u64) -> Self {
        SimTime(secs.saturating_mul(1_000_000))
    }

    /// Build from fractional seconds, clamping negatives to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs <= 0.0 {
            SimTime::ZERO
        } else {
            SimTime((secs * 1_000_000.0).round() as u64)
        }
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: SimTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(self, span: Duration) -> Self {
        SimTime(self.0.saturating_add(micros(span)))
    }
}

/// Whole microseconds in a span, saturating at `u64::MAX`.
pub(crate) fn micros(span: Duration) -> u64 {
    u64::try_from(span.as_micros()).unwrap_or(u64::MAX)
}

/// Divide a span by a fraction such as a duty-cycle budget.
pub(crate) fn stretch(span: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return Duration::MAX;
    }
    Duration::try_from_secs_f64(span.as_secs_f64() / fraction).unwrap_or(Duration::MAX)
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(SimTime::from_secs(2).as_micros(), 2_000_000);
        assert_eq!(SimTime::from_millis(3).as_micros(), 3_000);
        assert_eq!(SimTime::from_secs_f64(1.5), SimTime::from_millis(1500));
        assert_eq!(SimTime::from_secs_f64(-4.0), SimTime::ZERO);
    }

    #[test]
    fn test_arithmetic_saturates() {
        let t = SimTime::from_secs(10);
        assert_eq!(t + Duration::from_secs(5), SimTime::from_secs(15));
        assert_eq!(SimTime::from_secs(3) - t, Duration::ZERO);
        assert_eq!(SimTime::MAX + Duration::from_secs(1), SimTime::MAX);
    }

    #[test]
    fn test_stretch_by_duty_cycle() {
        let airtime = Duration::from_millis(50);
        assert_eq!(stretch(airtime, 0.01), Duration::from_secs(5));
        assert_eq!(stretch(airtime, 0.0), Duration::MAX);
    }
}
