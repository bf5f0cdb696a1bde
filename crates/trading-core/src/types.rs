use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Last-trade print from the market-data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

/// Indicator values for one bar. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Directional-strength index (ADX, 0-100)
    pub trend_strength: f64,

    /// True-range volatility as a fraction of price
    pub volatility: f64,

    /// Moving average of `volatility`
    pub volatility_ma: f64,

    pub trend_direction: TrendDirection,

    /// Current volume / average volume
    pub volume_ratio: f64,

    /// |short MA - long MA| / long MA
    #[serde(default)]
    pub ma_separation: f64,

    /// Range efficiency: net move / total move (0-1)
    #[serde(default)]
    pub price_structure: f64,

    /// (close - long MA) / long MA, signed
    #[serde(default)]
    pub price_deviation: f64,

    /// Number of bars the snapshot was computed from
    pub sample_size: usize,

    pub timestamp: DateTime<Utc>,
}

impl IndicatorSnapshot {
    /// Current volatility relative to its moving average (1.0 when the average is zero).
    pub fn volatility_ratio(&self) -> f64 {
        if self.volatility_ma > 0.0 {
            self.volatility / self.volatility_ma
        } else {
            1.0
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            self.trend_strength,
            self.volatility,
            self.volatility_ma,
            self.volume_ratio,
            self.ma_separation,
            self.price_structure,
            self.price_deviation,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    Long,
    Short,
}

impl SignalDirection {
    pub fn side(&self) -> Side {
        match self {
            SignalDirection::Long => Side::Buy,
            SignalDirection::Short => Side::Sell,
        }
    }
}

/// Output of an external signal generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: SignalDirection,
    pub confidence: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// One take-profit rung: at `pct` favourable move, exit `fraction` of the position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTier {
    pub pct: f64,
    pub fraction: f64,
}

impl TakeProfitTier {
    pub fn new(pct: f64, fraction: f64) -> Self {
        Self { pct, fraction }
    }
}

/// Links an order intent through approval to its execution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Why an intent was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    StopExit,
    TakeProfit,
}

impl OrderPurpose {
    pub fn is_exit(&self) -> bool {
        !matches!(self, OrderPurpose::Entry)
    }
}

/// Candidate order, consumed exactly once by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub reference_price: f64,
    pub correlation_id: CorrelationId,
    pub signal_confidence: f64,
    pub purpose: OrderPurpose,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        reference_price: f64,
        signal_confidence: f64,
        purpose: OrderPurpose,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            reference_price,
            correlation_id: CorrelationId::new(),
            signal_confidence,
            purpose,
            created_at,
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity * self.reference_price
    }
}

/// Risk-approved order. Only the risk manager creates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub reference_price: f64,
    pub correlation_id: CorrelationId,
    pub signal_confidence: f64,
    pub purpose: OrderPurpose,
    pub approval_id: Uuid,
    pub approved_at: DateTime<Utc>,
}

impl ApprovedOrder {
    /// One-way transformation of an intent; the intent is consumed.
    pub fn approve(intent: OrderIntent, approved_at: DateTime<Utc>) -> Self {
        Self {
            symbol: intent.symbol,
            side: intent.side,
            quantity: intent.quantity,
            reference_price: intent.reference_price,
            correlation_id: intent.correlation_id,
            signal_confidence: intent.signal_confidence,
            purpose: intent.purpose,
            approval_id: Uuid::new_v4(),
            approved_at,
        }
    }
}

/// Confirmed execution of part or all of an order, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub correlation_id: CorrelationId,
    pub purpose: OrderPurpose,
    pub filled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_keeps_correlation_id() {
        let intent = OrderIntent::new("AAPL", Side::Buy, 10.0, 190.0, 0.8, OrderPurpose::Entry, Utc::now());
        let id = intent.correlation_id;
        let approved = ApprovedOrder::approve(intent, Utc::now());
        assert_eq!(approved.correlation_id, id);
        assert_eq!(approved.quantity, 10.0);
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn correlation_id_round_trips_through_display() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn volatility_ratio_defaults_to_one_without_average() {
        let snap = IndicatorSnapshot {
            trend_strength: 30.0,
            volatility: 0.02,
            volatility_ma: 0.0,
            trend_direction: TrendDirection::Up,
            volume_ratio: 1.0,
            ma_separation: 0.0,
            price_structure: 0.0,
            price_deviation: 0.0,
            sample_size: 50,
            timestamp: Utc::now(),
        };
        assert_eq!(snap.volatility_ratio(), 1.0);
    }
}
