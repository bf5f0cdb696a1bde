use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker_trait::MarketDataSource;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use trading_core::{Clock, ConfigError, CoreEvent, EventSink, Shutdown, Tick};

use crate::retry::RetryPolicy;
use crate::sleeper::Sleeper;

const NEVER: i64 = i64::MIN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// No tick for this long halts new order submission
    pub stale_after: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            retry: RetryPolicy::market_data(),
        }
    }
}

impl FeedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after.is_zero() {
            return Err(ConfigError::invalid("feed_stale_secs", "must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid("heartbeat_secs", "must be positive"));
        }
        if self.retry.max_attempts.is_some() {
            return Err(ConfigError::invalid(
                "feed_retry",
                "market data reconnects must be unbounded",
            ));
        }
        self.retry.validate()
    }
}

#[derive(Debug)]
struct HealthInner {
    stale_after_ms: i64,
    last_tick_ms: AtomicI64,
    ticks: AtomicU64,
    since_heartbeat: AtomicU64,
    flagged_stale: AtomicBool,
}

/// Lock-free feed liveness shared by the supervisor (writer) and the gateway (reader).
#[derive(Debug, Clone)]
pub struct FeedHealth {
    inner: Arc<HealthInner>,
}

impl FeedHealth {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                stale_after_ms: i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX),
                last_tick_ms: AtomicI64::new(NEVER),
                ticks: AtomicU64::new(0),
                since_heartbeat: AtomicU64::new(0),
                flagged_stale: AtomicBool::new(false),
            }),
        }
    }

    /// Note a tick arriving at `at` (local receive time).
    pub fn record_tick(&self, at: DateTime<Utc>) {
        self.inner
            .last_tick_ms
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
        self.inner.ticks.fetch_add(1, Ordering::Relaxed);
        self.inner.since_heartbeat.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_tick_ms.load(Ordering::Acquire) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// True when no tick has ever arrived or the last one is older than `stale_after`.
    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        match self.inner.last_tick_ms.load(Ordering::Acquire) {
            NEVER => true,
            ms => now.timestamp_millis().saturating_sub(ms) > self.inner.stale_after_ms,
        }
    }

    pub fn ticks_received(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    fn take_since_heartbeat(&self) -> u64 {
        self.inner.since_heartbeat.swap(0, Ordering::Relaxed)
    }

    /// Set the stale flag, returning the previous value.
    fn set_flagged_stale(&self, stale: bool) -> bool {
        self.inner.flagged_stale.swap(stale, Ordering::AcqRel)
    }
}

/// Keeps the market-data stream alive: reconnects forever, heartbeats, flags staleness.
pub struct MarketDataSupervisor {
    source: Arc<dyn MarketDataSource>,
    symbols: Vec<String>,
    config: FeedConfig,
    health: FeedHealth,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
}

impl MarketDataSupervisor {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        symbols: Vec<String>,
        config: FeedConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let health = FeedHealth::new(config.stale_after);
        Self {
            source,
            symbols,
            config,
            health,
            clock,
            sleeper,
            events,
        }
    }

    pub fn health(&self) -> FeedHealth {
        self.health.clone()
    }

    /// Stream ticks into `tx` until shutdown or until the receiver is dropped.
    pub async fn run(self, tx: mpsc::Sender<Tick>, mut shutdown: Shutdown) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                result = self.source.connect(&self.symbols) => result,
                _ = shutdown.wait() => return,
            };

            match connected {
                Ok(mut stream) => {
                    tracing::info!(
                        "Market data connected via {} ({} symbols)",
                        self.source.source_name(),
                        self.symbols.len()
                    );
                    attempt = 0;
                    loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(tick)) => {
                                    self.health.record_tick(self.clock.now());
                                    if tx.send(tick).await.is_err() {
                                        tracing::info!("Tick consumer gone, stopping market data");
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    tracing::warn!("Market data stream error: {}", e);
                                    break;
                                }
                                None => {
                                    tracing::warn!("Market data stream ended");
                                    break;
                                }
                            },
                            _ = heartbeat.tick() => self.heartbeat(),
                            _ = shutdown.wait() => {
                                tracing::info!("Market data shutdown requested");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Market data connect failed: {}", e);
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.retry.reconnect_delay(attempt);
            tracing::warn!(
                "Reconnecting market data in {:.1}s (attempt {})",
                delay.as_secs_f64(),
                attempt
            );

            let sleep = self.sleeper.sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = heartbeat.tick() => self.heartbeat(),
                    _ = shutdown.wait() => return,
                }
            }
        }
    }

    /// Periodic liveness check. Emits a heartbeat and flips the stale flag on edges.
    pub fn heartbeat(&self) {
        let now = self.clock.now();
        let ticks = self.health.take_since_heartbeat();
        let last_tick_at = self.health.last_tick_at();

        tracing::debug!("Feed heartbeat: {} ticks since last, last tick {:?}", ticks, last_tick_at);
        self.events.emit(CoreEvent::FeedHeartbeat {
            ticks_since_last: ticks,
            last_tick_at,
            at: now,
        });

        let halted = self.health.is_halted(now);
        let was_stale = self.health.set_flagged_stale(halted);
        if halted && !was_stale {
            tracing::error!(
                "No market data for over {}s (last tick {:?}), halting new orders",
                self.config.stale_after.as_secs(),
                last_tick_at
            );
            self.events.emit(CoreEvent::FeedStale { last_tick_at, at: now });
        } else if !halted && was_stale {
            tracing::info!("Market data recovered, resuming order submission");
            self.events.emit(CoreEvent::FeedRecovered { at: now });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::RecordingSleeper;
    use async_trait::async_trait;
    use broker_trait::{BrokerError, TickStream};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use trading_core::{shutdown_channel, ManualClock, RecordingSink};

    type Script = Result<Vec<Result<Tick, BrokerError>>, BrokerError>;

    struct ScriptedSource {
        script: Mutex<VecDeque<Script>>,
        connects: AtomicU32,
    }

    impl ScriptedSource {
        fn new(script: Vec<Script>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                connects: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        async fn connect(&self, _symbols: &[String]) -> Result<TickStream, BrokerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(items)) => Ok(futures_util::stream::iter(items).boxed()),
                Some(Err(e)) => Err(e),
                // Script exhausted: connected but silent
                None => Ok(futures_util::stream::pending().boxed()),
            }
        }

        fn source_name(&self) -> &str {
            "scripted"
        }
    }

    fn tick(symbol: &str, price: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            volume: 1.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn health_halts_until_first_tick_and_after_timeout() {
        let health = FeedHealth::new(Duration::from_secs(15));
        let now = Utc::now();
        assert!(health.is_halted(now));
        assert_eq!(health.last_tick_at(), None);

        health.record_tick(now);
        assert!(!health.is_halted(now + chrono::Duration::seconds(15)));
        assert!(health.is_halted(now + chrono::Duration::seconds(16)));
        assert_eq!(health.ticks_received(), 1);
    }

    #[test]
    fn heartbeat_flags_stale_and_recovery_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sink = Arc::new(RecordingSink::new());
        let supervisor = MarketDataSupervisor::new(
            Arc::new(ScriptedSource::new(vec![])),
            vec!["SPY".into()],
            FeedConfig::default(),
            clock.clone(),
            Arc::new(RecordingSleeper::new()),
            sink.clone(),
        );

        supervisor.heartbeat();
        supervisor.heartbeat();
        assert_eq!(sink.count("feed_stale"), 1);

        supervisor.health().record_tick(clock.now());
        supervisor.heartbeat();
        assert_eq!(sink.count("feed_recovered"), 1);

        clock.advance(chrono::Duration::seconds(16));
        supervisor.heartbeat();
        assert_eq!(sink.count("feed_stale"), 2);
        assert_eq!(sink.count("feed_heartbeat"), 4);
    }

    #[tokio::test]
    async fn reconnects_without_giving_up() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(BrokerError::Network("refused".into())),
            Ok(vec![
                Ok(tick("SPY", 100.0)),
                Ok(tick("SPY", 100.5)),
                Err(BrokerError::Network("reset".into())),
            ]),
            Err(BrokerError::Unauthorized("bad key".into())),
            Ok(vec![Ok(tick("QQQ", 400.0))]),
        ]));
        let sleeper = Arc::new(RecordingSleeper::new());
        let config = FeedConfig {
            heartbeat_interval: Duration::from_secs(3600),
            retry: RetryPolicy::market_data().without_jitter(),
            ..Default::default()
        };
        let supervisor = MarketDataSupervisor::new(
            source.clone(),
            vec!["SPY".into(), "QQQ".into()],
            config,
            Arc::new(ManualClock::new(Utc::now())),
            sleeper.clone(),
            Arc::new(RecordingSink::new()),
        );
        let health = supervisor.health();

        let (tx, mut rx) = mpsc::channel(16);
        let (trigger, shutdown) = shutdown_channel();
        let task = tokio::spawn(supervisor.run(tx, shutdown));

        let mut prices = Vec::new();
        for _ in 0..3 {
            prices.push(rx.recv().await.unwrap().price);
        }
        assert_eq!(prices, vec![100.0, 100.5, 400.0]);
        assert_eq!(health.ticks_received(), 3);

        trigger.trigger();
        task.await.unwrap();

        // Attempt counter resets after each successful connect
        assert_eq!(
            sleeper.slept()[..3],
            [
                Duration::from_millis(500),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ]
        );
        assert!(source.connects.load(Ordering::SeqCst) >= 4);
    }
}
