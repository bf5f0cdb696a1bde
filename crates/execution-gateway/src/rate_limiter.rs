use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trading_core::{Clock, ConfigError};

use crate::sleeper::Sleeper;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Target requests per minute, kept below the broker's hard limit
    pub per_minute: u32,
    /// Bucket capacity
    pub burst: u32,
    /// Fraction of the current limit removed on each throttling response
    pub throttle_cut: f64,
    /// The limit never drops below this fraction of the target
    pub floor_fraction: f64,
    /// Consecutive successes needed for one restore step
    pub restore_after: u32,
    /// Fraction of the target added back per restore step
    pub restore_step: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 180,
            burst: 10,
            throttle_cut: 0.2,
            floor_fraction: 0.25,
            restore_after: 50,
            restore_step: 0.05,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.per_minute == 0 {
            return Err(ConfigError::invalid("rate_limit_per_min", "must be positive"));
        }
        if self.burst == 0 {
            return Err(ConfigError::invalid("rate_limit_burst", "must be positive"));
        }
        for (field, value) in [
            ("throttle_cut", self.throttle_cut),
            ("floor_fraction", self.floor_fraction),
            ("restore_step", self.restore_step),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::invalid(field, format!("must be in (0, 1), got {}", value)));
            }
        }
        if self.restore_after == 0 {
            return Err(ConfigError::invalid("restore_after", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Current (possibly reduced) limit, requests per minute
    limit: f64,
    last_refill: DateTime<Utc>,
    consecutive_successes: u32,
}

/// Token bucket shared by every broker call. Check-and-take happens under one lock.
pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        let bucket = Bucket {
            tokens: config.burst as f64,
            limit: config.per_minute as f64,
            last_refill: clock.now(),
            consecutive_successes: 0,
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
            clock,
            sleeper,
        }
    }

    fn target(&self) -> f64 {
        self.config.per_minute as f64
    }

    fn refill(&self, bucket: &mut Bucket, now: DateTime<Utc>) {
        let elapsed = (now - bucket.last_refill)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        if elapsed > 0.0 {
            let rate_per_sec = bucket.limit / 60.0;
            bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(self.config.burst as f64);
            bucket.last_refill = now;
        }
    }

    /// Take a token if one is available, else report how long until one is.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        let wait = missing / (bucket.limit / 60.0);
        Err(Duration::from_secs_f64(wait.max(0.001)))
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    tracing::debug!("Rate limiter: waiting {:.3}s for broker slot", wait.as_secs_f64());
                    self.sleeper.sleep(wait).await;
                }
            }
        }
    }

    /// Broker answered normally. Every `restore_after` in a row win back part of the target.
    pub fn on_success(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.consecutive_successes += 1;
        if bucket.consecutive_successes >= self.config.restore_after && bucket.limit < self.target() {
            bucket.consecutive_successes = 0;
            let restored = (bucket.limit + self.target() * self.config.restore_step).min(self.target());
            tracing::info!(
                "Rate limit restored {:.0} -> {:.0}/min after sustained success",
                bucket.limit,
                restored
            );
            bucket.limit = restored;
        }
    }

    /// Broker throttled us: cut the limit and drain the bucket.
    pub fn on_throttled(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.consecutive_successes = 0;
        let floor = self.target() * self.config.floor_fraction;
        let reduced = (bucket.limit * (1.0 - self.config.throttle_cut)).max(floor);
        tracing::warn!("Broker throttled: rate limit {:.0} -> {:.0}/min", bucket.limit, reduced);
        bucket.limit = reduced;
        bucket.tokens = bucket.tokens.min(0.0);
    }

    /// Current requests-per-minute limit
    pub fn current_limit(&self) -> f64 {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner()).limit
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
