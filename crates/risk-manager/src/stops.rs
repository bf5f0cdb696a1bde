use std::collections::{BTreeSet, HashMap};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use technical_analysis::AtrTracker;
use thiserror::Error;
use trading_core::{Bar, ConfigError, CorrelationId, Side, TakeProfitTier};

use crate::store::Position;

/// Quantities below this are treated as zero
pub const QTY_EPSILON: f64 = 1e-9;

/// Exactly one per position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopConfig {
    Static { pct: f64 },
    Trailing { pct: f64 },
    AtrBased { multiplier: f64 },
    TimeBased { max_duration: Duration },
}

impl StopConfig {
    pub fn kind(&self) -> StopKind {
        match self {
            StopConfig::Static { .. } => StopKind::Static,
            StopConfig::Trailing { .. } => StopKind::Trailing,
            StopConfig::AtrBased { .. } => StopKind::AtrBased,
            StopConfig::TimeBased { .. } => StopKind::TimeBased,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            StopConfig::Static { pct } | StopConfig::Trailing { pct } => {
                if !(pct > 0.0 && pct < 1.0) {
                    return Err(ConfigError::invalid("stop_pct", format!("must be in (0, 1), got {}", pct)));
                }
            }
            StopConfig::AtrBased { multiplier } => {
                if !(multiplier > 0.0 && multiplier.is_finite()) {
                    return Err(ConfigError::invalid(
                        "atr_multiplier",
                        format!("must be positive, got {}", multiplier),
                    ));
                }
            }
            StopConfig::TimeBased { max_duration } => {
                if max_duration.is_zero() {
                    return Err(ConfigError::invalid("max_hold", "must be positive"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Static,
    Trailing,
    AtrBased,
    TimeBased,
}

impl StopKind {
    pub fn name(&self) -> &'static str {
        match self {
            StopKind::Static => "static",
            StopKind::Trailing => "trailing",
            StopKind::AtrBased => "atr",
            StopKind::TimeBased => "time",
        }
    }
}

/// Stop bookkeeping attached 1:1 to an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopState {
    pub config: StopConfig,
    pub side: Side,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub trigger_price: Option<f64>,
    pub trigger_time: Option<DateTime<Utc>>,
    /// Best price seen since entry (high for longs, low for shorts)
    pub water_mark: f64,
    pub take_profit_tiers: Vec<TakeProfitTier>,
    pub fired_tiers: BTreeSet<usize>,
}

impl StopState {
    pub fn new(
        config: StopConfig,
        side: Side,
        entry_price: f64,
        opened_at: DateTime<Utc>,
        take_profit_tiers: Vec<TakeProfitTier>,
    ) -> Self {
        let mut state = Self {
            config,
            side,
            entry_price,
            opened_at,
            trigger_price: None,
            trigger_time: None,
            water_mark: entry_price,
            take_profit_tiers,
            fired_tiers: BTreeSet::new(),
        };
        match config {
            StopConfig::Static { pct } | StopConfig::Trailing { pct } => {
                state.trigger_price = Some(offset(side, entry_price, pct));
            }
            StopConfig::TimeBased { max_duration } => {
                state.trigger_time = chrono::Duration::from_std(max_duration)
                    .ok()
                    .and_then(|d| opened_at.checked_add_signed(d));
            }
            StopConfig::AtrBased { .. } => {}
        }
        state
    }

    /// Tighten (never loosen) the trigger toward `candidate`.
    fn ratchet(&mut self, candidate: f64) {
        let tighter = match (self.trigger_price, self.side) {
            (None, _) => candidate,
            (Some(current), Side::Buy) => current.max(candidate),
            (Some(current), Side::Sell) => current.min(candidate),
        };
        self.trigger_price = Some(tighter);
    }

    fn update_water_mark(&mut self, price: f64) {
        self.water_mark = match self.side {
            Side::Buy => self.water_mark.max(price),
            Side::Sell => self.water_mark.min(price),
        };
    }

    fn price_crossed(&self, price: f64) -> bool {
        match (self.trigger_price, self.side) {
            (Some(trigger), Side::Buy) => price <= trigger,
            (Some(trigger), Side::Sell) => price >= trigger,
            (None, _) => false,
        }
    }

    /// Favourable move from entry as a fraction
    fn favourable_move(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }
}

/// Entry price moved against the position by `pct`.
fn offset(side: Side, price: f64, pct: f64) -> f64 {
    match side {
        Side::Buy => price * (1.0 - pct),
        Side::Sell => price * (1.0 + pct),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Stop(StopKind),
    TakeProfit { tier: usize },
}

/// Forced exit decided on a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub symbol: String,
    /// Side of the closing order
    pub side: Side,
    pub quantity: f64,
    pub reason: ExitReason,
    pub trigger_price: Option<f64>,
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// An exit order sent for a position that has not reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingExit {
    pub symbol: String,
    pub quantity: f64,
    pub filled: f64,
    pub is_stop: bool,
}

impl WorkingExit {
    pub fn open_qty(&self) -> f64 {
        (self.quantity - self.filled).max(0.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StopError {
    #[error("Position {symbol} has no stop configuration")]
    MissingConfiguration { symbol: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDefaults {
    /// Applied when the approving profile does not name a stop
    pub default_stop: Option<StopConfig>,
    pub atr_period: usize,
}

impl Default for StopDefaults {
    fn default() -> Self {
        Self {
            default_stop: Some(StopConfig::Static { pct: 0.02 }),
            atr_period: AtrTracker::DEFAULT_PERIOD,
        }
    }
}

impl StopDefaults {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.atr_period == 0 {
            return Err(ConfigError::invalid("atr_period", "must be positive"));
        }
        if let Some(stop) = &self.default_stop {
            stop.validate()?;
        }
        Ok(())
    }
}

/// Evaluates every position's stop and take-profit ladder on each tick.
#[derive(Debug, Clone)]
pub struct StopManager {
    defaults: StopDefaults,
    stops: HashMap<String, StopState>,
    atr: HashMap<String, AtrTracker>,
    /// Exit orders still working, by correlation id. Survives detach.
    working: HashMap<CorrelationId, WorkingExit>,
}

impl StopManager {
    pub fn new(defaults: StopDefaults) -> Self {
        Self {
            defaults,
            stops: HashMap::new(),
            atr: HashMap::new(),
            working: HashMap::new(),
        }
    }

    pub fn defaults(&self) -> &StopDefaults {
        &self.defaults
    }

    pub fn get(&self, symbol: &str) -> Option<&StopState> {
        self.stops.get(symbol)
    }

    /// Attach a stop to a freshly opened position. Falls back to the default stop.
    /// With no stop at all the position is left unguarded and the next tick reports it.
    pub fn attach(
        &mut self,
        position: &Position,
        stop: Option<StopConfig>,
        take_profit_tiers: Vec<TakeProfitTier>,
    ) {
        let config = match stop.or(self.defaults.default_stop) {
            Some(config) => config,
            None => {
                self.stops.remove(&position.symbol);
                return;
            }
        };

        let mut state = StopState::new(
            config,
            position.side,
            position.avg_entry_price,
            position.opened_at,
            take_profit_tiers,
        );
        if let StopConfig::AtrBased { multiplier } = config {
            if let Some(atr) = self.atr_value(&position.symbol) {
                state.ratchet(offset_abs(position.side, state.entry_price, atr * multiplier));
            }
        }

        tracing::info!(
            "Attached {} stop to {} {} (entry {:.2}, trigger {:?})",
            config.kind().name(),
            position.side,
            position.symbol,
            position.avg_entry_price,
            state.trigger_price
        );
        self.stops.insert(position.symbol.clone(), state);
    }

    /// Re-anchor entry-based stops after the position was added to.
    pub fn on_position_increased(&mut self, position: &Position) {
        if let Some(state) = self.stops.get_mut(&position.symbol) {
            state.entry_price = position.avg_entry_price;
            if let StopConfig::Static { pct } = state.config {
                state.ratchet(offset(state.side, state.entry_price, pct));
            }
        }
    }

    pub fn detach(&mut self, symbol: &str) -> Option<StopState> {
        self.stops.remove(symbol)
    }

    /// Feed a completed bar into the symbol's ATR and re-tighten ATR stops.
    pub fn on_bar(&mut self, symbol: &str, bar: &Bar) -> Option<f64> {
        let period = self.defaults.atr_period;
        let atr = self
            .atr
            .entry(symbol.to_string())
            .or_insert_with(|| AtrTracker::new(period))
            .update(bar.high, bar.low, bar.close);

        if let (Some(atr), Some(state)) = (atr, self.stops.get_mut(symbol)) {
            if let StopConfig::AtrBased { multiplier } = state.config {
                state.ratchet(offset_abs(state.side, state.entry_price, atr * multiplier));
            }
        }
        atr
    }

    pub fn atr_value(&self, symbol: &str) -> Option<f64> {
        self.atr.get(symbol).and_then(|a| a.value())
    }

    /// Evaluate stop and take-profit tiers for one position at `price`.
    pub fn on_tick(
        &mut self,
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExitSignal>, StopError> {
        let committed = self.working_exit_qty(&position.symbol, None);
        let stop_working = self.stop_exit_working(&position.symbol);

        let state = self
            .stops
            .get_mut(&position.symbol)
            .ok_or_else(|| StopError::MissingConfiguration {
                symbol: position.symbol.clone(),
            })?;

        state.update_water_mark(price);
        if let StopConfig::Trailing { pct } = state.config {
            let candidate = offset(state.side, state.water_mark, pct);
            state.ratchet(candidate);
        }

        if stop_working {
            return Ok(Vec::new());
        }

        let available = (position.quantity - committed).max(0.0);
        if available <= QTY_EPSILON {
            return Ok(Vec::new());
        }
        let exit_side = position.side.opposite();

        let stop_hit = match state.config {
            StopConfig::TimeBased { .. } => state.trigger_time.map(|t| now >= t).unwrap_or(false),
            _ => state.price_crossed(price),
        };

        if stop_hit {
            tracing::warn!(
                "{} stop triggered for {} at {:.2} (trigger {:?})",
                state.config.kind().name(),
                position.symbol,
                price,
                state.trigger_price
            );
            return Ok(vec![ExitSignal {
                symbol: position.symbol.clone(),
                side: exit_side,
                quantity: available,
                reason: ExitReason::Stop(state.config.kind()),
                trigger_price: state.trigger_price,
                price,
                at: now,
            }]);
        }

        let mut exits = Vec::new();
        let mut remaining = available;
        let favourable = state.favourable_move(price);

        for (index, tier) in state.take_profit_tiers.iter().enumerate() {
            if remaining <= QTY_EPSILON || state.fired_tiers.contains(&index) || favourable < tier.pct {
                continue;
            }

            let quantity = tier_quantity(position.quantity, tier.fraction, remaining);
            if quantity <= 0.0 {
                continue;
            }

            state.fired_tiers.insert(index);
            remaining -= quantity;

            tracing::info!(
                "Take-profit tier {} hit for {} at {:.2} (+{:.2}%), exiting {}",
                index,
                position.symbol,
                price,
                favourable * 100.0,
                quantity
            );
            exits.push(ExitSignal {
                symbol: position.symbol.clone(),
                side: exit_side,
                quantity,
                reason: ExitReason::TakeProfit { tier: index },
                trigger_price: Some(state.entry_price * (1.0 + position.side.sign() * tier.pct)),
                price,
                at: now,
            });
        }

        Ok(exits)
    }

    /// Record an exit order for `symbol` as working. A known id is left as is.
    pub fn track_exit(&mut self, id: CorrelationId, symbol: &str, quantity: f64, is_stop: bool) {
        self.working.entry(id).or_insert_with(|| WorkingExit {
            symbol: symbol.to_string(),
            quantity,
            filled: 0.0,
            is_stop,
        });
    }

    pub fn working_exit(&self, id: &CorrelationId) -> Option<&WorkingExit> {
        self.working.get(id)
    }

    /// Unfilled quantity of working exits for `symbol`, optionally leaving one order out.
    pub fn working_exit_qty(&self, symbol: &str, exclude: Option<&CorrelationId>) -> f64 {
        self.working
            .iter()
            .filter(|(id, w)| w.symbol == symbol && Some(*id) != exclude)
            .map(|(_, w)| w.open_qty())
            .sum()
    }

    pub fn exit_pending(&self, symbol: &str) -> bool {
        self.working.values().any(|w| w.symbol == symbol && w.open_qty() > QTY_EPSILON)
    }

    fn stop_exit_working(&self, symbol: &str) -> bool {
        self.working.values().any(|w| w.symbol == symbol && w.is_stop)
    }

    /// An exit order filled some quantity.
    pub fn on_exit_fill(&mut self, id: &CorrelationId, quantity: f64) {
        if let Some(exit) = self.working.get_mut(id) {
            exit.filled += quantity;
        }
    }

    /// An exit order reached a terminal state (filled, rejected or cancelled).
    /// Only its own unfilled remainder is released.
    pub fn on_exit_settled(&mut self, id: &CorrelationId) -> Option<WorkingExit> {
        self.working.remove(id)
    }
}

impl Default for StopManager {
    fn default() -> Self {
        Self::new(StopDefaults::default())
    }
}

/// Size of a take-profit exit. Whole shares with a floor of one, fractional below one share.
fn tier_quantity(position_qty: f64, fraction: f64, remaining: f64) -> f64 {
    if fraction >= 1.0 {
        return remaining;
    }
    let target = position_qty * fraction;
    if remaining >= 1.0 {
        target.floor().max(1.0).min(remaining)
    } else {
        target.min(remaining)
    }
}

/// Price `distance` against the position from `price`.
fn offset_abs(side: Side, price: f64, distance: f64) -> f64 {
    match side {
        Side::Buy => price - distance,
        Side::Sell => price + distance,
    }
}
