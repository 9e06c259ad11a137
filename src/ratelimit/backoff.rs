//! Capped exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Compute `min(initial * 2^(n-1), max)`, rounded up to whole seconds.
///
/// `n` counts failures (or requests) starting at 1; `n = 0` is treated as 1.
/// Overflow saturates to `max`.
pub fn backoff(n: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = n.max(1) - 1;
    let delay = 1u32
        .checked_shl(exponent)
        .and_then(|factor| initial.checked_mul(factor))
        .unwrap_or(max);
    ceil_secs(delay.min(max))
}

fn ceil_secs(d: Duration) -> Duration {
    if d.subsec_nanos() == 0 {
        d
    } else {
        Duration::from_secs(d.as_secs().saturating_add(1))
    }
}

/// A backoff parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay after the `n`-th consecutive event.
    pub fn delay(&self, n: u32) -> Duration {
        backoff(n, self.initial, self.max)
    }
}

impl Default for BackoffPolicy {
    /// One minute, doubling up to one hour.
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_first_delay_is_initial() {
        assert_eq!(backoff(1, MIN, HOUR), MIN);
        assert_eq!(backoff(0, MIN, HOUR), MIN);
    }

    #[test]
    fn test_doubling_sequence() {
        let delays: Vec<u64> = (1..=7).map(|n| backoff(n, MIN, HOUR).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600]);
    }

    #[test]
    fn test_never_exceeds_max_and_is_monotonic() {
        let mut previous = Duration::ZERO;
        for n in 0..=200 {
            let delay = backoff(n, MIN, HOUR);
            assert!(delay <= HOUR, "n={} gave {:?}", n, delay);
            assert!(delay >= previous, "n={} decreased", n);
            previous = delay;
        }
        assert_eq!(backoff(u32::MAX, MIN, HOUR), HOUR);
    }

    #[test]
    fn test_rounds_up_to_whole_seconds() {
        let initial = Duration::from_millis(1500);
        assert_eq!(backoff(1, initial, HOUR), Duration::from_secs(2));
        assert_eq!(backoff(2, initial, HOUR), Duration::from_secs(3));
    }

    #[test]
    fn test_policy_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(3), Duration::from_secs(240));
    }
}
