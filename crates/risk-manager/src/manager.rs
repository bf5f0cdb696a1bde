use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::watch;
use trading_core::{
    ApprovedOrder, Bar, Clock, CorrelationId, CoreEvent, EventSink, Fill, OrderIntent,
    OrderPurpose, RiskCheckType, RiskRejection, TakeProfitTier, Tick,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::limits::{PositionLimitGuard, ReturnHistory, RiskLimits};
use crate::stops::{ExitReason, StopConfig, StopDefaults, StopError, StopManager, QTY_EPSILON};
use crate::store::{FillEffect, PortfolioSnapshot, Position, PositionError, PositionStore};

/// Correlation ids remembered for duplicate detection
const SEEN_CAPACITY: usize = 10_000;

/// Stop and take-profit ladder to attach when an entry fills.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitPlan {
    pub stop: Option<StopConfig>,
    pub take_profit_tiers: Vec<TakeProfitTier>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Approved(ApprovedOrder),
    Rejected {
        /// First failing check, the reported reason
        primary: RiskRejection,
        /// Every failing check, `primary` included
        breaches: Vec<RiskRejection>,
    },
}

impl RiskVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskVerdict::Approved(_))
    }

    pub fn rejection(&self) -> Option<&RiskRejection> {
        match self {
            RiskVerdict::Rejected { primary, .. } => Some(primary),
            RiskVerdict::Approved(_) => None,
        }
    }
}

/// Owns the position store and every pre-trade guard. Single writer: the engine task.
pub struct RiskManager {
    guard: PositionLimitGuard,
    stops: StopManager,
    store: PositionStore,
    returns: ReturnHistory,
    breaker: Option<CircuitBreaker>,
    seen: HashSet<CorrelationId>,
    seen_order: VecDeque<CorrelationId>,
    /// Exit plans of approved entries, keyed until the entry fills or dies
    pending_plans: HashMap<CorrelationId, ExitPlan>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl RiskManager {
    pub fn new(
        limits: RiskLimits,
        stop_defaults: StopDefaults,
        initial_capital: f64,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            guard: PositionLimitGuard::new(limits),
            stops: StopManager::new(stop_defaults),
            store: PositionStore::new(initial_capital),
            returns: ReturnHistory::new(),
            breaker: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            pending_plans: HashMap::new(),
            clock,
            events,
        }
    }

    /// Consult this breaker (read-only) before approving anything.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn snapshot(&self) -> &PortfolioSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PortfolioSnapshot>> {
        self.store.subscribe()
    }

    pub fn stops(&self) -> &StopManager {
        &self.stops
    }

    pub fn stops_mut(&mut self) -> &mut StopManager {
        &mut self.stops
    }

    /// Approve or reject an intent. Each correlation id is decided once.
    pub fn evaluate(&mut self, intent: OrderIntent, plan: Option<ExitPlan>) -> RiskVerdict {
        if self.seen.contains(&intent.correlation_id) {
            let rejection = RiskRejection::new(
                RiskCheckType::DuplicateIntent,
                format!("correlation id {} was already decided", intent.correlation_id),
            );
            return self.reject(&intent, vec![rejection]);
        }
        self.remember(intent.correlation_id);

        let mut breaches = Vec::new();

        if let Some(breaker) = &self.breaker {
            if breaker.is_open() {
                breaches.push(RiskRejection::new(
                    RiskCheckType::CircuitBreaker,
                    format!("circuit breaker {} is open", breaker.domain()),
                ));
            }
        }

        if let Some(reason) = self.invalid_reason(&intent) {
            breaches.push(RiskRejection::new(RiskCheckType::InvalidOrder, reason));
            return self.reject(&intent, breaches);
        }

        breaches.extend(self.guard.check(&intent, self.store.snapshot(), &self.returns));

        if !breaches.is_empty() {
            return self.reject(&intent, breaches);
        }

        let now = self.clock.now();
        if intent.purpose.is_exit() {
            self.stops.track_exit(
                intent.correlation_id,
                &intent.symbol,
                intent.quantity,
                intent.purpose == OrderPurpose::StopExit,
            );
        } else {
            self.pending_plans
                .insert(intent.correlation_id, plan.unwrap_or_default());
        }

        tracing::info!(
            "Approved {} {} {} @ {:.2} ({:?}, id {})",
            intent.side,
            intent.quantity,
            intent.symbol,
            intent.reference_price,
            intent.purpose,
            intent.correlation_id
        );
        RiskVerdict::Approved(ApprovedOrder::approve(intent, now))
    }

    fn invalid_reason(&self, intent: &OrderIntent) -> Option<String> {
        if !(intent.quantity > 0.0 && intent.quantity.is_finite()) {
            return Some(format!("quantity {} must be positive", intent.quantity));
        }
        if !(intent.reference_price > 0.0 && intent.reference_price.is_finite()) {
            return Some(format!("reference price {} must be positive", intent.reference_price));
        }
        if intent.purpose.is_exit() {
            match self.store.position(&intent.symbol) {
                None => return Some(format!("no open {} position to exit", intent.symbol)),
                Some(p) if p.side == intent.side => {
                    return Some(format!("exit {} does not close a {} position", intent.side, p.side))
                }
                Some(p) => {
                    let committed = self
                        .stops
                        .working_exit_qty(&intent.symbol, Some(&intent.correlation_id));
                    let free = (p.quantity - committed).max(0.0);
                    if intent.quantity > free + QTY_EPSILON {
                        return Some(format!(
                            "exit quantity {} exceeds position {} less {} in working exits",
                            intent.quantity, p.quantity, committed
                        ));
                    }
                }
            }
        }
        None
    }

    fn reject(&mut self, intent: &OrderIntent, breaches: Vec<RiskRejection>) -> RiskVerdict {
        let primary = breaches[0].clone();
        tracing::warn!(
            "Risk rejected {} {} {} ({}): {}",
            intent.side,
            intent.quantity,
            intent.symbol,
            primary.kind.name(),
            primary.detail
        );

        if intent.purpose.is_exit() && primary.kind != RiskCheckType::DuplicateIntent {
            // Let the stop fire again on the next tick
            self.stops.on_exit_settled(&intent.correlation_id);
        }

        self.events.emit(CoreEvent::RiskRejected {
            symbol: intent.symbol.clone(),
            correlation_id: intent.correlation_id,
            check: primary.kind,
            detail: primary.detail.clone(),
            at: self.clock.now(),
        });

        RiskVerdict::Rejected { primary, breaches }
    }

    fn remember(&mut self, id: CorrelationId) {
        if self.seen.insert(id) {
            self.seen_order.push_back(id);
            while self.seen_order.len() > SEEN_CAPACITY {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }

    /// Mark the tick price and run the stop manager. Returns exit intents to evaluate.
    pub fn on_tick(&mut self, tick: &Tick) -> Result<Vec<OrderIntent>, StopError> {
        self.store.mark_price(&tick.symbol, tick.price, tick.timestamp);

        let position = match self.store.position(&tick.symbol) {
            Some(p) => p.clone(),
            None => return Ok(Vec::new()),
        };

        let exits = self.stops.on_tick(&position, tick.price, tick.timestamp)?;

        let mut intents = Vec::with_capacity(exits.len());
        for exit in exits {
            let purpose = match exit.reason {
                ExitReason::Stop(kind) => {
                    self.events.emit(CoreEvent::StopTriggered {
                        symbol: exit.symbol.clone(),
                        stop_kind: kind.name().to_string(),
                        trigger_price: exit.trigger_price,
                        price: exit.price,
                        at: exit.at,
                    });
                    OrderPurpose::StopExit
                }
                ExitReason::TakeProfit { tier } => {
                    self.events.emit(CoreEvent::TakeProfitTriggered {
                        symbol: exit.symbol.clone(),
                        tier,
                        quantity: exit.quantity,
                        price: exit.price,
                        at: exit.at,
                    });
                    OrderPurpose::TakeProfit
                }
            };

            let intent = OrderIntent::new(
                exit.symbol,
                exit.side,
                exit.quantity,
                exit.price,
                1.0,
                purpose,
                exit.at,
            );
            self.stops.track_exit(
                intent.correlation_id,
                &intent.symbol,
                intent.quantity,
                purpose == OrderPurpose::StopExit,
            );
            intents.push(intent);
        }
        Ok(intents)
    }

    /// Feed a completed bar: ATR for stops, returns for VaR.
    pub fn on_bar(&mut self, symbol: &str, bar: &Bar, prev_close: Option<f64>) {
        self.stops.on_bar(symbol, bar);
        if let Some(prev) = prev_close {
            if prev > 0.0 {
                self.returns.push(symbol, (bar.close - prev) / prev);
            }
        }
    }

    /// Apply a confirmed fill. Fills for one symbol must arrive in broker order.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<FillEffect, PositionError> {
        let effect = self.store.apply_fill(fill)?;

        if fill.purpose.is_exit() {
            self.stops.on_exit_fill(&fill.correlation_id, fill.quantity);
        }

        match effect {
            FillEffect::Opened | FillEffect::Flipped { .. } => {
                let plan = self
                    .pending_plans
                    .get(&fill.correlation_id)
                    .cloned()
                    .unwrap_or_default();
                if let Some(position) = self.store.position(&fill.symbol).cloned() {
                    self.stops.detach(&fill.symbol);
                    self.stops.attach(&position, plan.stop, plan.take_profit_tiers);
                }
            }
            FillEffect::Increased => {
                if let Some(position) = self.store.position(&fill.symbol).cloned() {
                    self.stops.on_position_increased(&position);
                }
            }
            FillEffect::Closed { .. } => {
                self.stops.detach(&fill.symbol);
            }
            FillEffect::Reduced { .. } => {}
        }

        self.emit_position(&fill.symbol);
        Ok(effect)
    }

    /// The order behind `correlation_id` reached a terminal state.
    pub fn on_order_terminal(&mut self, correlation_id: &CorrelationId) {
        self.pending_plans.remove(correlation_id);
        if let Some(exit) = self.stops.on_exit_settled(correlation_id) {
            if exit.open_qty() > QTY_EPSILON {
                tracing::info!(
                    "Exit {} for {} settled with {} unfilled, released",
                    correlation_id,
                    exit.symbol,
                    exit.open_qty()
                );
            }
        }
    }

    fn emit_position(&self, symbol: &str) {
        let at = self.clock.now();
        let event = match self.store.position(symbol) {
            Some(Position {
                side,
                quantity,
                avg_entry_price,
                unrealized_pnl,
                ..
            }) => CoreEvent::PositionSnapshot {
                symbol: symbol.to_string(),
                side: Some(*side),
                quantity: *quantity,
                avg_entry_price: *avg_entry_price,
                unrealized_pnl: *unrealized_pnl,
                at,
            },
            None => CoreEvent::PositionSnapshot {
                symbol: symbol.to_string(),
                side: None,
                quantity: 0.0,
                avg_entry_price: 0.0,
                unrealized_pnl: 0.0,
                at,
            },
        };
        self.events.emit(event);
    }
}
