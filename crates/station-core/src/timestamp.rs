//! Absolute sample-clock timestamps.
//!
//! A [`TimeStamp`] counts subband samples since the Unix epoch. Station
//! hardware runs a 160 or 200 MHz clock followed by a 1024-point polyphase
//! filter, so one subband sample lasts `1024 / clock_hz` seconds. At 200 MHz
//! that is not an integral number of samples per second, which is why RSP
//! packets carry a whole-second counter plus a block index; [`TimeStamp::from_rsp`]
//! combines the two with the same rounding as the station firmware.
//!
//! # Example
//!
//! ```
//! use station_core::TimeStamp;
//!
//! let clock = 200_000_000;
//! let t = TimeStamp::from_rsp(10, 3, clock);
//! assert_eq!(t.rsp_seconds(), 10);
//! assert_eq!(t.rsp_block(), 3);
//! assert!(t < t + 1);
//! assert!(TimeStamp::never(clock) > t + 1_000_000);
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::error::TimeError;

/// Number of station clock ticks per subband sample.
pub const SUBBAND_FFT_SIZE: i64 = 1024;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Absolute sample index on a station's subband clock.
///
/// Ordering, equality and hashing only look at the sample count; mixing
/// timestamps of different clocks is a logic error caught by debug assertions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeStamp {
    count: i64,
    clock_hz: u32,
}

impl TimeStamp {
    /// Wrap a raw sample count.
    pub const fn new(count: i64, clock_hz: u32) -> Self {
        Self { count, clock_hz }
    }

    /// The "never" sentinel: later than every reachable timestamp.
    ///
    /// Used as an unbounded deadline. Arithmetic on it stays at the sentinel.
    pub const fn never(clock_hz: u32) -> Self {
        Self {
            count: i64::MAX,
            clock_hz,
        }
    }

    /// Whether this is the [`never`](Self::never) sentinel.
    pub const fn is_never(&self) -> bool {
        self.count == i64::MAX
    }

    /// Raw sample count.
    pub const fn count(&self) -> i64 {
        self.count
    }

    /// Station clock this timestamp is expressed in.
    pub const fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Subband samples per second for this clock.
    pub fn samples_per_second(&self) -> f64 {
        f64::from(self.clock_hz) / SUBBAND_FFT_SIZE as f64
    }

    /// Current wall-clock time as a sample count.
    pub fn now(clock_hz: u32) -> Self {
        Self::from_datetime(Utc::now(), clock_hz)
    }

    /// Convert seconds since the epoch to a sample count (rounded down).
    pub fn convert(seconds: f64, clock_hz: u32) -> Self {
        let count = (seconds * f64::from(clock_hz) / SUBBAND_FFT_SIZE as f64).floor();
        // float -> int casts saturate, so absurd inputs land on the sentinels
        Self::new(count as i64, clock_hz)
    }

    /// Convert a wall-clock instant to a sample count (rounded down).
    pub fn from_datetime(time: DateTime<Utc>, clock_hz: u32) -> Self {
        let nanos = i128::from(time.timestamp()) * NANOS_PER_SECOND
            + i128::from(time.timestamp_subsec_nanos());
        let count =
            nanos * i128::from(clock_hz) / (i128::from(SUBBAND_FFT_SIZE) * NANOS_PER_SECOND);
        Self::new(clamp_i128(count), clock_hz)
    }

    /// Seconds since the epoch.
    pub fn to_seconds(&self) -> f64 {
        self.count as f64 * SUBBAND_FFT_SIZE as f64 / f64::from(self.clock_hz)
    }

    /// Wall-clock instant of this sample, `None` for the sentinel or when out
    /// of chrono's range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.is_never() || self.clock_hz == 0 {
            return None;
        }
        let nanos = i128::from(self.count) * i128::from(SUBBAND_FFT_SIZE) * NANOS_PER_SECOND
            / i128::from(self.clock_hz);
        let nanos = i64::try_from(nanos).ok()?;
        Some(Utc.timestamp_nanos(nanos))
    }

    /// Build a timestamp from an RSP header's second counter and block index.
    pub fn from_rsp(seconds: u32, block: u32, clock_hz: u32) -> Self {
        let base = (i64::from(seconds) * i64::from(clock_hz) + SUBBAND_FFT_SIZE / 2)
            / SUBBAND_FFT_SIZE;
        Self::new(base + i64::from(block), clock_hz)
    }

    /// Whole-second counter as carried in an RSP header.
    pub fn rsp_seconds(&self) -> i64 {
        if self.clock_hz == 0 {
            return 0;
        }
        let seconds = i128::from(self.count) * i128::from(SUBBAND_FFT_SIZE)
            / i128::from(self.clock_hz);
        clamp_i128(seconds)
    }

    /// Block index relative to the start of [`rsp_seconds`](Self::rsp_seconds).
    pub fn rsp_block(&self) -> i64 {
        let base = (i128::from(self.rsp_seconds()) * i128::from(self.clock_hz)
            + i128::from(SUBBAND_FFT_SIZE / 2))
            / i128::from(SUBBAND_FFT_SIZE);
        clamp_i128(i128::from(self.count) - base)
    }

    /// Add a sample delta, failing instead of wrapping.
    pub fn checked_add(self, delta: i64) -> Result<Self, TimeError> {
        if self.is_never() {
            return Ok(self);
        }
        // landing on the sentinel counts as overflow
        self.count
            .checked_add(delta)
            .filter(|&count| count != i64::MAX)
            .map(|count| Self::new(count, self.clock_hz))
            .ok_or(TimeError::Overflow {
                count: self.count,
                delta,
            })
    }

    /// Number of samples from `earlier` to `self` (saturating).
    pub fn samples_since(&self, earlier: TimeStamp) -> i64 {
        debug_assert_eq!(self.clock_hz, earlier.clock_hz, "clock mismatch");
        self.count.saturating_sub(earlier.count)
    }
}

fn clamp_i128(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

impl PartialEq for TimeStamp {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
    }
}

impl Eq for TimeStamp {}

impl Hash for TimeStamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.count.hash(state);
    }
}

impl PartialOrd for TimeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.clock_hz, other.clock_hz, "clock mismatch");
        self.count.cmp(&other.count)
    }
}

impl Add<i64> for TimeStamp {
    type Output = TimeStamp;

    /// Saturating addition; the sentinel absorbs any delta.
    fn add(self, delta: i64) -> TimeStamp {
        if self.is_never() {
            return self;
        }
        TimeStamp::new(self.count.saturating_add(delta), self.clock_hz)
    }
}

impl AddAssign<i64> for TimeStamp {
    fn add_assign(&mut self, delta: i64) {
        *self = *self + delta;
    }
}

impl Sub<i64> for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, delta: i64) -> TimeStamp {
        if self.is_never() {
            return self;
        }
        TimeStamp::new(self.count.saturating_sub(delta), self.clock_hz)
    }
}

impl SubAssign<i64> for TimeStamp {
    fn sub_assign(&mut self, delta: i64) {
        *self = *self - delta;
    }
}

impl Sub<TimeStamp> for TimeStamp {
    type Output = i64;

    fn sub(self, other: TimeStamp) -> i64 {
        self.samples_since(other)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return write!(f, "never");
        }
        match self.to_datetime() {
            Some(time) => write!(
                f,
                "{} ({})",
                self.count,
                time.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            ),
            None => write!(f, "{}", self.count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK_200: u32 = 200_000_000;
    const CLOCK_160: u32 = 160_000_000;

    #[test]
    fn test_rsp_roundtrip_200mhz() {
        for seconds in [0u32, 1, 2, 3, 1_700_000_000] {
            for block in [0u32, 1, 16, 195_311] {
                let t = TimeStamp::from_rsp(seconds, block, CLOCK_200);
                let again = TimeStamp::from_rsp(
                    t.rsp_seconds() as u32,
                    t.rsp_block() as u32,
                    CLOCK_200,
                );
                assert_eq!(t, again, "seconds={seconds} block={block}");
            }
        }
    }

    #[test]
    fn test_rsp_seconds_at_160mhz_is_exact() {
        // 160 MHz gives exactly 156250 samples per second
        let t = TimeStamp::from_rsp(4, 0, CLOCK_160);
        assert_eq!(t.count(), 4 * 156_250);
        assert_eq!(t.rsp_seconds(), 4);
        assert_eq!(t.rsp_block(), 0);
    }

    #[test]
    fn test_convert_and_back() {
        let t = TimeStamp::convert(2.0, CLOCK_160);
        assert_eq!(t.count(), 312_500);
        assert!((t.to_seconds() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_now_is_recent() {
        let t = TimeStamp::now(CLOCK_200);
        let datetime = t.to_datetime().unwrap();
        let drift = (Utc::now() - datetime).num_milliseconds().abs();
        assert!(drift < 1_000, "drift {drift} ms");
    }

    #[test]
    fn test_never_is_sticky() {
        let never = TimeStamp::never(CLOCK_200);
        assert!(never.is_never());
        assert!((never + 10).is_never());
        assert!((never - 10).is_never());
        assert_eq!(never.checked_add(5).unwrap(), never);
        assert!(TimeStamp::now(CLOCK_200) < never);
        assert_eq!(never.to_string(), "never");
    }

    #[test]
    fn test_checked_add_overflow() {
        let t = TimeStamp::new(i64::MAX - 10, CLOCK_200);
        assert!(matches!(t.checked_add(100), Err(TimeError::Overflow { .. })));
        let low = TimeStamp::new(i64::MIN + 1, CLOCK_200);
        assert!(low.checked_add(-5).is_err());
        assert!(matches!(t.checked_add(10), Err(TimeError::Overflow { .. })));
        assert_eq!(t.checked_add(9).unwrap().count(), i64::MAX - 1);
    }

    #[test]
    fn test_ordering_and_difference() {
        let a = TimeStamp::new(100, CLOCK_200);
        let b = a + 5;
        assert!(a < b);
        assert_eq!(b - a, 5);
        assert_eq!(a - b, -5);
        let mut c = a;
        c += 7;
        c -= 2;
        assert_eq!(c, b);
    }
}
