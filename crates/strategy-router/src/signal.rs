use chrono::{DateTime, Utc};
use trading_core::{IndicatorSnapshot, Signal};

use crate::profile::StrategyId;

/// Inputs handed to a signal generator for one completed bar.
#[derive(Debug, Clone)]
pub struct SignalContext<'a> {
    pub symbol: &'a str,
    pub snapshot: &'a IndicatorSnapshot,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// External signal source. The router only decides which one is listened to.
pub trait SignalGenerator: Send + Sync {
    fn strategy_id(&self) -> StrategyId;

    fn generate(&self, ctx: &SignalContext<'_>) -> Option<Signal>;
}
