//! Backoff policy: computes the delay before retry attempt N.

use std::time::Duration;

use rand::Rng;

/// Backoff growth curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Exponential,
    Linear,
    Constant,
}

/// Retry tunables shared by the refresh path and the upstream HTTP client.
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    pub strategy: Strategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for Policy {
    /// Matches the token manager's default: 3 attempts, exponential base 1s, cap 30s, jitter on.
    fn default() -> Self {
        Self {
            strategy: Strategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl Policy {
    /// Delay before the `attempt`th retry (1-indexed: `attempt=1` is the
    /// first retry after the initial call fails), before jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            Strategy::Constant => self.initial_delay,
            Strategy::Linear => self.initial_delay.saturating_mul(attempt),
            Strategy::Exponential => {
                let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
                Duration::from_secs_f64(scaled)
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay before the `attempt`th retry, with jitter applied if enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let mut rng = rand::rng();
        let factor = rng.random_range(0.75..=1.25);
        Duration::from_secs_f64((base.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: Strategy) -> Policy {
        Policy {
            strategy,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 5,
            jitter: false,
        }
    }

    #[test]
    fn exponential_matches_the_closed_form_without_jitter() {
        let p = policy(Strategy::Exponential);
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn exponential_is_capped_at_max_delay() {
        let p = policy(Strategy::Exponential);
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn linear_scales_by_attempt_number() {
        let p = policy(Strategy::Linear);
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn constant_never_changes() {
        let p = policy(Strategy::Constant);
        assert_eq!(p.delay_for_attempt(1), p.delay_for_attempt(4));
    }

    #[test]
    fn jitter_keeps_delay_within_twenty_five_percent() {
        let mut p = policy(Strategy::Exponential);
        p.jitter = true;
        let base = Duration::from_secs(2).as_secs_f64();
        for _ in 0..50 {
            let d = p.delay_for_attempt(2).as_secs_f64();
            assert!(d >= base * 0.75 - 0.001 && d <= base * 1.25 + 0.001, "delay {d} out of jitter band");
        }
    }
}
