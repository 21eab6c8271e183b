//! Reconnect delay policy: exponential backoff with jitter

use std::time::Duration;

/// Default base delay for the first reconnect wait
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Fraction of the computed delay that jitter may add on top
pub const JITTER_FRACTION: f64 = 0.2;

// 2^32 seconds is far beyond any max_backoff; exponents above this would
// only overflow the multiplication.
const MAX_EXPONENT: u32 = 32;

/// Backoff schedule for one tunnel. The failure counter itself lives with the
/// supervisor (it is part of the published status); the policy is a pure
/// function of that count.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Deterministic part of the delay: `min(max, base * 2^failures)`
    pub fn raw_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(MAX_EXPONENT);
        let factor = 2u64.saturating_pow(exponent);
        let scaled = if factor > u32::MAX as u64 {
            Duration::MAX
        } else {
            self.base.saturating_mul(factor as u32)
        };
        scaled.min(self.max)
    }

    /// Delay to wait before the next attempt: raw delay plus up to 20% jitter
    /// so a fleet of tunnels dropped by one outage does not reconnect in
    /// lockstep. Never exceeds `max * 1.2`.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        let raw = self.raw_delay(consecutive_failures);
        let jitter = raw.mul_f64(rand::random::<f64>() * JITTER_FRACTION);
        raw + jitter
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        )
    }

    #[test]
    fn test_raw_delay_doubles_then_caps() {
        let policy = policy(1000, 60_000);

        assert_eq!(policy.raw_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.raw_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.raw_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.raw_delay(3), Duration::from_millis(8000));
        assert_eq!(policy.raw_delay(5), Duration::from_millis(32_000));
        // Caps at max from here on
        assert_eq!(policy.raw_delay(6), Duration::from_millis(60_000));
        assert_eq!(policy.raw_delay(7), Duration::from_millis(60_000));
        assert_eq!(policy.raw_delay(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn test_raw_delay_is_monotonic() {
        let policy = policy(250, 30_000);
        let mut previous = Duration::ZERO;
        for failures in 0..40 {
            let delay = policy.raw_delay(failures);
            assert!(delay >= previous, "delay shrank at {} failures", failures);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = policy(1000, 8000);
        for failures in 0..10 {
            let raw = policy.raw_delay(failures);
            let ceiling = raw.mul_f64(1.0 + JITTER_FRACTION);
            for _ in 0..100 {
                let delay = policy.next_delay(failures);
                assert!(delay >= raw, "jitter must never shorten the delay");
                assert!(delay <= ceiling, "jitter exceeded 20% of {:?}", raw);
            }
        }
    }

    #[test]
    fn test_max_smaller_than_base_is_lifted_to_base() {
        let policy = policy(5000, 1000);
        assert_eq!(policy.raw_delay(0), Duration::from_millis(5000));
        assert_eq!(policy.max(), Duration::from_millis(5000));
    }
}
