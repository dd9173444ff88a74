//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// `delay = min(base * 2^(attempt - 1), max) * (1 ± jitter)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    /// The delay before retrying after `attempt` (1-based) failed, before
    /// jitter is applied.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        if exponent >= 32 {
            return self.max;
        }

        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.ceiling(attempt).as_secs_f64();
        let spread = delay * self.jitter.clamp(0.0, 1.0);

        let jittered = if spread > 0.0 {
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };

        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const fn backoff(jitter: f64) -> Backoff {
        Backoff::new(Duration::from_secs(60), Duration::from_secs(3600), jitter)
    }

    #[test]
    fn doubles_until_capped() {
        let backoff = backoff(0.0);
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_secs(120));
        assert_eq!(backoff.delay(3), Duration::from_secs(240));
        assert_eq!(backoff.delay(6), Duration::from_secs(1920));
        assert_eq!(backoff.delay(7), Duration::from_secs(3600));
        assert_eq!(backoff.delay(40), Duration::from_secs(3600));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn zeroth_attempt_is_base() {
        assert_eq!(backoff(0.0).delay(0), Duration::from_secs(60));
    }

    #[test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    fn jitter_stays_in_range() {
        let backoff = backoff(0.2);
        for attempt in 1..10 {
            let ceiling = backoff.ceiling(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = backoff.delay(attempt).as_secs_f64();
                assert!(delay >= ceiling * 0.8 - 1e-6, "{delay} below range of {ceiling}");
                assert!(delay <= ceiling * 1.2 + 1e-6, "{delay} above range of {ceiling}");
            }
        }
    }
}
