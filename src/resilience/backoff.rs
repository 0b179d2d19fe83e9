//! Retry delay calculation with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffStrategy, RetryConfig};

impl RetryConfig {
    /// Preset for calls against the Airtable API.
    pub fn airtable() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after the 0-based `attempt` failed.
    ///
    /// The strategy's raw delay is capped at `max_delay`, then scaled by a
    /// uniform factor in [0.5, 1.0] when jitter is enabled.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let raw = match self.backoff_strategy {
            BackoffStrategy::Exponential => base * self.exponential_base.powi(attempt as i32),
            BackoffStrategy::Linear => base * f64::from(attempt + 1),
            BackoffStrategy::Fixed => base,
        };

        let mut delay_ms = raw.min(self.max_delay_ms as f64);

        if self.jitter {
            delay_ms *= rand::thread_rng().gen_range(0.5..=1.0);
        }

        Duration::from_micros((delay_ms * 1000.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_strategy(strategy)
            .with_jitter(false)
    }

    #[test]
    fn test_strategies() {
        let exp = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(exp.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(exp.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(exp.calculate_delay(10), Duration::from_millis(1000));

        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(linear.calculate_delay(3), Duration::from_millis(400));

        let fixed = no_jitter(BackoffStrategy::Fixed);
        assert_eq!(fixed.calculate_delay(7), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = no_jitter(BackoffStrategy::Exponential).with_jitter(true);
        for _ in 0..200 {
            let delay = config.calculate_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_airtable_preset() {
        let config = RetryConfig::airtable();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_delay_ms, 30_000);
    }
}
