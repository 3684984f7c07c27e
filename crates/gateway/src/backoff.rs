//! Reconnect delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    /// Fraction of the computed delay added at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Self {
        let min = if min.is_zero() {
            Duration::from_millis(1)
        } else {
            min
        };
        Self {
            min,
            max: max.max(min),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.min.saturating_mul(1u32 << exponent).min(self.max);
        let extra = if self.jitter > 0.0 {
            base.mul_f64(self.jitter * rand::rng().random::<f64>())
        } else {
            Duration::ZERO
        };
        (base + extra).clamp(self.min, self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30), 0.2)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let b = Backoff::new(Duration::from_secs(2), Duration::from_secs(30), 0.0);
        let delays: Vec<u64> = (1..=6).map(|n| b.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(b.delay(0), Duration::from_secs(2));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = Backoff::new(Duration::from_secs(2), Duration::from_secs(30), 1.0);
        for attempt in 1..50 {
            let d = b.delay(attempt);
            assert!(d >= b.min && d <= b.max, "{d:?}");
        }
    }

    #[test]
    fn zero_minimum_is_raised() {
        let b = Backoff::new(Duration::ZERO, Duration::ZERO, 0.5);
        assert!(!b.delay(1).is_zero());
        assert!(b.max >= b.min);
    }
}
