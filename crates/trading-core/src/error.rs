use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid or missing configuration. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Which pre-trade guard rejected an order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheckType {
    /// Broker failure domain is tripped
    CircuitBreaker,
    /// Correlation id was already approved or rejected
    DuplicateIntent,
    /// Non-positive or non-finite quantity
    InvalidOrder,
    /// Per-symbol notional ceiling
    SymbolNotional,
    /// Portfolio gross exposure ceiling
    ExposureLimit,
    /// Symbol or sector share of equity
    Concentration,
    /// Order price too far from the last trade, or no last trade at all
    PriceDeviation,
    /// Historical-simulation Value-at-Risk ceiling
    ValueAtRisk,
}

impl RiskCheckType {
    pub fn name(&self) -> &'static str {
        match self {
            RiskCheckType::CircuitBreaker => "circuit_breaker",
            RiskCheckType::DuplicateIntent => "duplicate_intent",
            RiskCheckType::InvalidOrder => "invalid_order",
            RiskCheckType::SymbolNotional => "symbol_notional",
            RiskCheckType::ExposureLimit => "exposure_limit",
            RiskCheckType::Concentration => "concentration",
            RiskCheckType::PriceDeviation => "price_deviation",
            RiskCheckType::ValueAtRisk => "value_at_risk",
        }
    }
}

/// Expected, non-fatal business outcome: the intent never becomes an order.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{} rejected: {detail}", kind.name())]
pub struct RiskRejection {
    pub kind: RiskCheckType,
    pub detail: String,
}

impl RiskRejection {
    pub fn new(kind: RiskCheckType, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Fast-fail from an open circuit breaker. Not a failure of the guarded call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit open for {domain} (retry in {:.1}s)", retry_in.as_secs_f64())]
pub struct CircuitOpenError {
    pub domain: String,
    pub retry_in: Duration,
}
