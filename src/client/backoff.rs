//! Exponential reconnect backoff.
//!
//! `delay(n) = min(base * multiplier^n, max) + jitter`, never below the
//! server's advised interval. Any successful handshake or `/meta/connect`
//! resets `n` to zero.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rand::Rng;

// ============================================================================
// BackoffPolicy
// ============================================================================

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First retry delay.
    pub base: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound before jitter.
    pub max: Duration,
    /// Random extra delay as a fraction of the computed delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.base > self.max {
            return Err("Backoff base must not exceed max".to_string());
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err("Backoff multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("Backoff jitter must be within [0, 1]".to_string());
        }
        Ok(())
    }

    /// Returns the un-jittered delay for `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(scaled as u64)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Attempt counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff at attempt zero.
    #[inline]
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Returns the number of delays handed out since the last reset.
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the next delay, at least `floor`, and advances the counter.
    pub fn next_delay(&mut self, floor: Duration) -> Duration {
        let mut delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.policy.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
            delay += delay.mul_f64(extra);
        }

        delay.max(floor)
    }

    /// Returns to attempt zero.
    #[inline]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_default_sequence() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay(Duration::ZERO).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_advice_interval_is_floor() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert_eq!(
            backoff.next_delay(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(backoff.next_delay(Duration::ZERO), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = Backoff::new(policy).next_delay(Duration::ZERO);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::default().validate().is_ok());
        let shrinking = BackoffPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
        let inverted = BackoffPolicy {
            base: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_reset(
            base_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            max_ms in 5_000u64..120_000,
            failures in 1usize..40,
        ) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(base_ms),
                multiplier,
                max: Duration::from_millis(max_ms),
                jitter: 0.0,
            };
            let mut backoff = Backoff::new(policy);

            let mut previous = Duration::ZERO;
            for _ in 0..failures {
                let delay = backoff.next_delay(Duration::ZERO);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max);
                previous = delay;
            }

            backoff.reset();
            prop_assert_eq!(backoff.next_delay(Duration::ZERO), policy.base);
        }
    }
}
