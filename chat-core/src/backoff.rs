//! Reconnection backoff with multiplicative jitter.
//!
//! Delay for attempt `n` (1-based) is `min(base * growth^(n-1) * jitter, max_delay)`,
//! with jitter drawn uniformly from `[jitter_min, jitter_max]`. Jitter keeps a
//! fleet of clients from reconnecting in lockstep after a server restart.

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub growth_factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Automatic attempts before giving up.
    pub max_attempts: u32,
    /// Lower bound of the jitter factor.
    pub jitter_min: f64,
    /// Upper bound of the jitter factor.
    pub jitter_max: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            growth_factor: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter_min: 0.9,
            jitter_max: 1.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given 1-based attempt, for an explicit jitter factor.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.growth_factor.powi(exponent) * jitter;
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Map a uniform value in `[0, 1)` onto the jitter range.
    pub fn jitter_from_unit(&self, unit: f64) -> f64 {
        self.jitter_min + unit.clamp(0.0, 1.0) * (self.jitter_max - self.jitter_min)
    }

    /// Sample a jitter factor from the OS random source.
    ///
    /// Falls back to a neutral factor of 1.0 if no randomness is available.
    pub fn sample_jitter(&self) -> f64 {
        let mut bytes = [0u8; 8];
        match getrandom::getrandom(&mut bytes) {
            Ok(()) => {
                // 53 random bits give a uniform f64 in [0, 1)
                let unit = (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64;
                self.jitter_from_unit(unit)
            }
            Err(_) => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn first_attempt_waits_base_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(millis(policy.delay_for_attempt(1, 1.0)), 1000);
    }

    #[test]
    fn delay_grows_geometrically() {
        let policy = BackoffPolicy::default();
        assert_eq!(millis(policy.delay_for_attempt(2, 1.0)), 1500);
        assert_eq!(millis(policy.delay_for_attempt(3, 1.0)), 2250);
        assert_eq!(millis(policy.delay_for_attempt(4, 1.0)), 3375);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(20, 1.1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX, 1.0), Duration::from_secs(30));
    }

    #[test]
    fn jitter_scales_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(millis(policy.delay_for_attempt(1, 0.9)), 900);
        assert_eq!(millis(policy.delay_for_attempt(1, 1.1)), 1100);
    }

    #[test]
    fn jitter_from_unit_spans_range() {
        let policy = BackoffPolicy::default();
        assert!((policy.jitter_from_unit(0.0) - 0.9).abs() < 1e-9);
        assert!((policy.jitter_from_unit(0.5) - 1.0).abs() < 1e-9);
        assert!((policy.jitter_from_unit(2.0) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn sampled_jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let jitter = policy.sample_jitter();
            assert!((0.9..=1.1).contains(&jitter), "jitter {} out of range", jitter);
        }
    }

    #[test]
    fn sampled_jitter_varies() {
        let policy = BackoffPolicy::default();
        let samples: Vec<f64> = (0..10).map(|_| policy.sample_jitter()).collect();
        let first = samples[0];
        assert!(samples.iter().any(|s| (s - first).abs() > f64::EPSILON));
    }
}
