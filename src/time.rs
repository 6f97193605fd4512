//! Microsecond-precision time values used by the throttler.
//!
//! [`Microseconds`] is an unsigned duration with saturating arithmetic. Instants are
//! `tokio::time::Instant`s (monotonic, and controllable with `tokio::time::pause` in tests);
//! [`Microseconds::between`] bridges the two.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use tokio::time::Instant;

/// A non-negative duration with microsecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Microseconds(u64);

impl Microseconds {
    /// Zero microseconds.
    pub const ZERO: Self = Self(0);

    /// Creates a value from a raw microsecond count.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Creates a value from (fractional) seconds. Negative or non-finite input yields zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_secs_f64(seconds: f64) -> Self {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Self::ZERO;
        }
        Self((seconds * 1_000_000.0).round() as u64)
    }

    /// Creates a value from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    /// Elapsed time from `earlier` to `later`, zero if `later` is not after `earlier`.
    #[must_use]
    pub fn between(earlier: Instant, later: Instant) -> Self {
        Self::from(later.saturating_duration_since(earlier))
    }

    /// Raw microsecond count.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Value in (fractional) seconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Multiplies by a non-negative factor, rounding to the nearest microsecond.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn multiply(self, factor: f64) -> Self {
        if !factor.is_finite() || factor <= 0.0 {
            return Self::ZERO;
        }
        Self((self.0 as f64 * factor).round() as u64)
    }

    /// Restricts the value to `[min, max]`.
    #[must_use]
    pub fn clamp_to(self, min: Self, max: Self) -> Self {
        self.max(min).min(max)
    }

    /// Converts to a std duration.
    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_micros(self.0)
    }
}

impl From<Duration> for Microseconds {
    #[allow(clippy::cast_possible_truncation)]
    fn from(value: Duration) -> Self {
        Self(value.as_micros().min(u128::from(u64::MAX)) as u64)
    }
}

impl Add for Microseconds {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Microseconds {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Microseconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}µs", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_secs_f64_rounds_to_micros() {
        assert_eq!(Microseconds::from_secs_f64(0.25).value(), 250_000);
        assert_eq!(Microseconds::from_secs_f64(1.000_000_4).value(), 1_000_000);
    }

    #[test]
    fn test_from_secs_f64_rejects_negative_and_nan() {
        assert_eq!(Microseconds::from_secs_f64(-3.0), Microseconds::ZERO);
        assert_eq!(Microseconds::from_secs_f64(f64::NAN), Microseconds::ZERO);
    }

    #[test]
    fn test_arithmetic_saturates() {
        let a = Microseconds::new(10);
        let b = Microseconds::new(25);
        assert_eq!(a - b, Microseconds::ZERO);
        assert_eq!(b - a, Microseconds::new(15));
        assert_eq!(Microseconds::new(u64::MAX) + a, Microseconds::new(u64::MAX));
    }

    #[test]
    fn test_multiply_and_clamp() {
        let d = Microseconds::from_millis(400);
        assert_eq!(d.multiply(2.5), Microseconds::from_millis(1_000));
        assert_eq!(d.multiply(-1.0), Microseconds::ZERO);

        let min = Microseconds::from_millis(500);
        let max = Microseconds::from_millis(900);
        assert_eq!(d.clamp_to(min, max), min);
        assert_eq!(d.multiply(3.0).clamp_to(min, max), max);
        assert_eq!(Microseconds::from_millis(700).clamp_to(min, max), Microseconds::from_millis(700));
    }

    #[test]
    fn test_ordering_is_total() {
        let mut values = vec![
            Microseconds::new(3),
            Microseconds::new(1),
            Microseconds::new(2),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![Microseconds::new(1), Microseconds::new(2), Microseconds::new(3)]
        );
    }

    #[tokio::test]
    async fn test_between_uses_monotonic_instants() {
        tokio::time::pause();
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let end = Instant::now();

        assert_eq!(Microseconds::between(start, end), Microseconds::from_millis(1500));
        assert_eq!(Microseconds::between(end, start), Microseconds::ZERO);
    }

    #[test]
    fn test_duration_conversion_roundtrip() {
        let d = Duration::from_micros(1_234_567);
        assert_eq!(Microseconds::from(d).as_duration(), d);
        assert!((Microseconds::from(d).as_secs_f64() - 1.234_567).abs() < 1e-9);
    }
}
