use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trading_core::{ApprovedOrder, CorrelationId, Side, Tick};

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerOrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl BrokerOrderStatus {
    /// No further fills can arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Filled
                | BrokerOrderStatus::Canceled
                | BrokerOrderStatus::Expired
                | BrokerOrderStatus::Rejected
        )
    }
}

/// Broker acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub client_order_id: CorrelationId,
    pub status: BrokerOrderStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Point-in-time view of an order at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReport {
    pub broker_order_id: String,
    pub client_order_id: CorrelationId,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub status: BrokerOrderStatus,
    /// Cumulative filled quantity
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

impl OrderReport {
    pub fn remaining_qty(&self) -> f64 {
        (self.quantity - self.filled_qty).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Retry-policy bucket for a broker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Timeouts, connection failures, 5xx: retried with backoff
    Transient,
    /// Throttled by the broker: retried and the rate limiter backs off
    RateLimited,
    /// The broker answered and said no: never retried
    Terminal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker call timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Broker server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited by broker")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Insufficient buying power: {0}")]
    InsufficientBuyingPower(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::Timeout { .. } | BrokerError::Network(_) => ErrorClass::Transient,
            BrokerError::Server { status, .. } if *status >= 500 => ErrorClass::Transient,
            BrokerError::RateLimited { .. } => ErrorClass::RateLimited,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Terminal
    }

    /// Broker-supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BrokerError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Broker traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit a market order. The correlation id is sent as the client order id.
    /// Implementations bound the call by their per-attempt timeout.
    async fn submit_order(&self, order: &ApprovedOrder) -> Result<OrderAck, BrokerError>;

    /// Get an order by broker id
    async fn get_order(&self, broker_order_id: &str) -> Result<OrderReport, BrokerError>;

    /// Look up an order by its client order id (None if the broker never saw it)
    async fn find_order(
        &self,
        _client_order_id: &CorrelationId,
    ) -> Result<Option<OrderReport>, BrokerError> {
        Ok(None)
    }

    /// Cancel an order by broker id
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}

pub type TickStream = BoxStream<'static, Result<Tick, BrokerError>>;

/// Live trade prints. A stream that ends or yields an error is reconnected by the caller.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn connect(&self, symbols: &[String]) -> Result<TickStream, BrokerError>;

    fn source_name(&self) -> &str;
}
