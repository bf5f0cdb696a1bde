use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use execution_gateway::{GatewayEvent, GatewayHandle};
use market_regime_detector::{RegimeConfig, RegimeDetector};
use risk_manager::{ExitPlan, FillEffect, RiskManager, RiskVerdict, StopConfig};
use strategy_router::{SignalContext, StrategyProfile, StrategyRouter};
use technical_analysis::{BarAggregator, IndicatorConfig, IndicatorEngine};
use tokio::sync::mpsc;
use trading_core::{Bar, CoreEvent, CorrelationId, EventSink, OrderIntent, Shutdown, Tick};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bar_duration: Duration,
    pub indicators: IndicatorConfig,
    pub regime: RegimeConfig,
}

struct SymbolState {
    aggregator: BarAggregator,
    indicators: IndicatorEngine,
    detector: RegimeDetector,
    last_close: Option<f64>,
}

impl SymbolState {
    fn new(config: &EngineConfig) -> Self {
        let bar = chrono::Duration::from_std(config.bar_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            aggregator: BarAggregator::new(bar),
            indicators: IndicatorEngine::new(config.indicators.clone()),
            detector: RegimeDetector::new(config.regime.clone()),
            last_close: None,
        }
    }
}

/// Single owner of portfolio state. Ticks in, approved orders out, execution reports back in.
pub struct Engine {
    config: EngineConfig,
    risk: RiskManager,
    router: StrategyRouter,
    gateway: GatewayHandle,
    symbols: HashMap<String, SymbolState>,
    /// Approved orders not yet terminal, by correlation id
    working: HashMap<CorrelationId, String>,
    events: Arc<dyn EventSink>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        risk: RiskManager,
        router: StrategyRouter,
        gateway: GatewayHandle,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            risk,
            router,
            gateway,
            symbols: HashMap::new(),
            working: HashMap::new(),
            events,
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<Tick>,
        mut gateway_events: mpsc::UnboundedReceiver<GatewayEvent>,
        mut shutdown: Shutdown,
    ) {
        tracing::info!("Engine started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                Some(event) = gateway_events.recv() => self.on_gateway_event(event),
                tick = ticks.recv() => match tick {
                    Some(tick) => self.on_tick(tick).await,
                    None => {
                        tracing::warn!("Tick channel closed");
                        break;
                    }
                },
            }
        }

        // Reports already delivered still belong in the book
        while let Ok(event) = gateway_events.try_recv() {
            self.on_gateway_event(event);
        }

        let snapshot = self.risk.snapshot();
        tracing::info!(
            "Engine stopped: {} open positions, equity {:.2}, realized P&L {:.2}, {} orders still working",
            snapshot.positions.len(),
            snapshot.equity(),
            snapshot.realized_pnl,
            self.working.len()
        );
    }

    /// Stops first, then bar aggregation.
    pub async fn on_tick(&mut self, tick: Tick) {
        match self.risk.on_tick(&tick) {
            Ok(exits) => {
                for intent in exits {
                    self.submit(intent, None).await;
                }
            }
            Err(e) => tracing::error!("Stop evaluation failed for {}: {}", tick.symbol, e),
        }

        let config = &self.config;
        let bar = self
            .symbols
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolState::new(config))
            .aggregator
            .push(&tick);

        if let Some(bar) = bar {
            self.on_bar(&tick.symbol, bar).await;
        }
    }

    async fn on_bar(&mut self, symbol: &str, bar: Bar) {
        let config = &self.config;
        let state = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(config));
        let prev_close = state.last_close.replace(bar.close);
        let snapshot = state.indicators.on_bar(bar.clone());
        let classification = state.detector.classify(&snapshot);

        self.risk.on_bar(symbol, &bar, prev_close);
        self.events.emit(CoreEvent::RegimeClassified {
            symbol: symbol.to_string(),
            regime: classification.regime.name().to_string(),
            confidence: classification.confidence,
            is_transitioning: classification.is_transitioning,
            at: bar.timestamp,
        });

        if self.risk.snapshot().position(symbol).is_some() || self.has_working(symbol) {
            return;
        }

        let ctx = SignalContext {
            symbol,
            snapshot: &snapshot,
            price: bar.close,
            timestamp: bar.timestamp,
        };
        let decision = self.router.decide(&classification, &ctx);
        if let Some(intent) = decision.intent {
            let plan = ExitPlan {
                stop: self.entry_stop(&decision.profile),
                take_profit_tiers: decision.profile.take_profit_tiers.clone(),
            };
            tracing::info!(
                "{} {} {} ({} in {}, confidence {:.2})",
                decision.profile.strategy_id.name(),
                intent.side,
                symbol,
                intent.quantity,
                classification.regime.name(),
                intent.signal_confidence
            );
            self.submit(intent, Some(plan)).await;
        }
    }

    /// Profile stop distance applies when the configured stop is percentage based.
    fn entry_stop(&self, profile: &StrategyProfile) -> Option<StopConfig> {
        match self.risk.stops().defaults().default_stop {
            Some(StopConfig::Static { .. }) if profile.stop_loss_pct > 0.0 => {
                Some(StopConfig::Static {
                    pct: profile.stop_loss_pct,
                })
            }
            _ => None,
        }
    }

    pub async fn submit(&mut self, intent: OrderIntent, plan: Option<ExitPlan>) {
        let id = intent.correlation_id;
        let symbol = intent.symbol.clone();

        match self.risk.evaluate(intent, plan) {
            RiskVerdict::Approved(order) => {
                self.working.insert(id, symbol);
                if let Err(e) = self.gateway.submit(order).await {
                    tracing::error!("Could not queue order {}: {}", id, e);
                    self.working.remove(&id);
                    self.risk.on_order_terminal(&id);
                }
            }
            RiskVerdict::Rejected { primary, breaches } => {
                tracing::debug!(
                    "Intent {} for {} rejected ({} checks failed): {}",
                    id,
                    symbol,
                    breaches.len(),
                    primary
                );
            }
        }
    }

    pub fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Fill(fill) => match self.risk.apply_fill(&fill.fill) {
                Ok(FillEffect::Closed { realized }) => tracing::info!(
                    "{} closed, realized P&L {:.2}",
                    fill.fill.symbol,
                    realized
                ),
                Ok(effect) => tracing::debug!("{} fill applied: {:?}", fill.fill.symbol, effect),
                Err(e) => tracing::error!(
                    "Fill for {} ({}) could not be applied: {}",
                    fill.fill.symbol,
                    fill.broker_order_id,
                    e
                ),
            },
            GatewayEvent::Report(report) => {
                self.working.remove(&report.correlation_id);
                self.risk.on_order_terminal(&report.correlation_id);
                if report.replayed {
                    tracing::debug!("Replayed outcome for {}", report.correlation_id);
                }
            }
        }
    }

    fn has_working(&self, symbol: &str) -> bool {
        self.working.values().any(|s| s == symbol)
    }
}
