use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use trading_core::ManualClock;

/// Suspension point for backoff, rate limiting and fill polling.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested delay.
/// With a clock attached, each sleep advances it by the requested amount.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
    clock: Option<Arc<ManualClock>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            slept: Mutex::new(Vec::new()),
            clock: Some(clock),
        }
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total(&self) -> Duration {
        self.slept().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        if let Some(clock) = &self.clock {
            if let Ok(step) = chrono::Duration::from_std(duration) {
                clock.advance(step);
            }
        }
        tokio::task::yield_now().await;
    }
}
