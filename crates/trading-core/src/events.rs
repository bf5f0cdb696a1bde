use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{CorrelationId, RiskCheckType, Side};

/// Structured events emitted by the core. Persistence is the consumer's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    RegimeClassified {
        symbol: String,
        regime: String,
        confidence: f64,
        is_transitioning: bool,
        at: DateTime<Utc>,
    },
    RiskRejected {
        symbol: String,
        correlation_id: CorrelationId,
        check: RiskCheckType,
        detail: String,
        at: DateTime<Utc>,
    },
    BreakerTransition {
        domain: String,
        from: String,
        to: String,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    OrderSubmitted {
        symbol: String,
        correlation_id: CorrelationId,
        broker_order_id: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
    OrderFilled {
        symbol: String,
        correlation_id: CorrelationId,
        side: Side,
        quantity: f64,
        price: f64,
        at: DateTime<Utc>,
    },
    OrderTerminal {
        symbol: String,
        correlation_id: CorrelationId,
        state: String,
        detail: Option<String>,
        at: DateTime<Utc>,
    },
    StopTriggered {
        symbol: String,
        stop_kind: String,
        trigger_price: Option<f64>,
        price: f64,
        at: DateTime<Utc>,
    },
    TakeProfitTriggered {
        symbol: String,
        tier: usize,
        quantity: f64,
        price: f64,
        at: DateTime<Utc>,
    },
    PositionSnapshot {
        symbol: String,
        side: Option<Side>,
        quantity: f64,
        avg_entry_price: f64,
        unrealized_pnl: f64,
        at: DateTime<Utc>,
    },
    FeedHeartbeat {
        ticks_since_last: u64,
        last_tick_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    FeedStale {
        last_tick_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    FeedRecovered {
        at: DateTime<Utc>,
    },
}

impl CoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::RegimeClassified { .. } => "regime_classified",
            CoreEvent::RiskRejected { .. } => "risk_rejected",
            CoreEvent::BreakerTransition { .. } => "breaker_transition",
            CoreEvent::OrderSubmitted { .. } => "order_submitted",
            CoreEvent::OrderFilled { .. } => "order_filled",
            CoreEvent::OrderTerminal { .. } => "order_terminal",
            CoreEvent::StopTriggered { .. } => "stop_triggered",
            CoreEvent::TakeProfitTriggered { .. } => "take_profit_triggered",
            CoreEvent::PositionSnapshot { .. } => "position_snapshot",
            CoreEvent::FeedHeartbeat { .. } => "feed_heartbeat",
            CoreEvent::FeedStale { .. } => "feed_stale",
            CoreEvent::FeedRecovered { .. } => "feed_recovered",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CoreEvent) {}
}

/// Logs each event as JSON at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::debug!(target: "core_events", "{}", json),
            Err(e) => tracing::warn!("Failed to serialize {} event: {}", event.kind(), e),
        }
    }
}

/// Forwards events to an unbounded channel (e.g. the journal task).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: CoreEvent) {
        // Receiver gone means shutdown is in progress
        let _ = self.tx.send(event);
    }
}

/// Sends each event to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: CoreEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Keeps every event in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: CoreEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
