use std::time::Duration;

use broker_trait::{BrokerError, ErrorClass};
use rand::Rng;
use serde::{Deserialize, Serialize};
use trading_core::ConfigError;

/// Bounded (or unbounded) exponential backoff. Pure: no clock, no sleeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; None never gives up
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random spread as a fraction of the delay (0 disables)
    pub jitter: f64,
}

impl RetryPolicy {
    /// Broker order submission: a few quick attempts.
    pub fn order_submission() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
            jitter: 0.1,
        }
    }

    /// Market-data reconnects: same backoff shape, never exhausted.
    pub fn market_data() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid("retry_max_attempts", "must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("retry_base_delay", "must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "retry_max_delay",
                format!(
                    "{}ms is below the base delay {}ms",
                    self.max_delay.as_millis(),
                    self.base_delay.as_millis()
                ),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("retry_jitter", "must be in [0, 1)"));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt < max).unwrap_or(true)
    }

    /// min(cap, base * 2^(attempt-1)), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt after `attempt` failed with `error`,
    /// or None when the error is terminal or attempts are used up.
    pub fn next_delay(&self, attempt: u32, error: &BrokerError) -> Option<Duration> {
        self.next_delay_with(attempt, error, &mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        error: &BrokerError,
        rng: &mut R,
    ) -> Option<Duration> {
        if error.class() == ErrorClass::Terminal || !self.allows_another(attempt) {
            return None;
        }

        let delay = self.jittered(self.backoff(attempt), rng);
        match error.retry_after() {
            Some(hint) => Some(delay.max(hint)),
            None => Some(delay),
        }
    }

    /// Backoff with jitter, ignoring error class. Used for reconnect loops.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.jittered(self.backoff(attempt), &mut rand::thread_rng())
    }

    fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rng.gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::order_submission()
    }
}
