use std::collections::HashMap;

use chrono::{DateTime, Utc};
use market_regime_detector::{Regime, RegimeClassification};
use serde::{Deserialize, Serialize};
use trading_core::{ConfigError, OrderIntent, OrderPurpose, Signal};

use crate::profile::{StrategyId, StrategyProfile};
use crate::signal::{SignalContext, SignalGenerator};

const MIN_VOL_ADJUSTMENT: f64 = 0.25;
const MAX_VOL_ADJUSTMENT: f64 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-bar volatility the sizing aims for (fraction of price)
    pub target_volatility: f64,
    /// Notional of a full-size (multiplier 1.0) entry
    pub base_notional: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            target_volatility: 0.01,
            base_notional: 5_000.0,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.target_volatility > 0.0 && self.target_volatility.is_finite()) {
            return Err(ConfigError::invalid(
                "target_volatility",
                format!("must be positive (got {})", self.target_volatility),
            ));
        }
        if !(self.base_notional > 0.0 && self.base_notional.is_finite()) {
            return Err(ConfigError::invalid(
                "base_notional",
                format!("must be positive (got {})", self.base_notional),
            ));
        }
        Ok(())
    }
}

/// Result of routing one bar for one symbol.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub profile: StrategyProfile,
    pub signal: Option<Signal>,
    pub intent: Option<OrderIntent>,
}

/// Maps a regime classification to a strategy profile and gates the generators.
pub struct StrategyRouter {
    config: RouterConfig,
    generators: HashMap<StrategyId, Box<dyn SignalGenerator>>,
}

impl StrategyRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            generators: HashMap::new(),
        }
    }

    /// Register a generator; replaces any previous one for the same strategy.
    pub fn register(&mut self, generator: Box<dyn SignalGenerator>) {
        let id = generator.strategy_id();
        if self.generators.insert(id, generator).is_some() {
            tracing::warn!("Replaced signal generator for {}", id.name());
        }
    }

    pub fn with_generator(mut self, generator: Box<dyn SignalGenerator>) -> Self {
        self.register(generator);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Select the profile for a classification and apply the sizing adjustments.
    pub fn route(&self, classification: &RegimeClassification, current_volatility: f64) -> StrategyProfile {
        let regime = classification.effective_regime();
        if regime == Regime::Unknown {
            return StrategyProfile::disabled();
        }

        let mut profile = StrategyProfile::for_regime(regime);
        let confidence = classification.confidence.clamp(0.0, 1.0);
        let confidence_adj = 0.5 + 0.5 * confidence;
        let volatility_adj = self.volatility_adjustment(current_volatility);

        profile.size_multiplier =
            (profile.size_multiplier * confidence_adj * volatility_adj).clamp(0.0, 1.0);
        profile
    }

    fn volatility_adjustment(&self, current_volatility: f64) -> f64 {
        if !(current_volatility > 0.0) || !current_volatility.is_finite() {
            return MAX_VOL_ADJUSTMENT;
        }
        (self.config.target_volatility / current_volatility).clamp(MIN_VOL_ADJUSTMENT, MAX_VOL_ADJUSTMENT)
    }

    /// Ask the generator the profile names for a signal, dropping anything the profile forbids.
    pub fn evaluate(&self, profile: &StrategyProfile, ctx: &SignalContext<'_>) -> Option<Signal> {
        if !profile.enabled {
            return None;
        }

        let generator = match self.generators.get(&profile.strategy_id) {
            Some(g) => g,
            None => {
                tracing::debug!("No generator registered for {}", profile.strategy_id.name());
                return None;
            }
        };

        let signal = generator.generate(ctx)?;

        if signal.symbol != ctx.symbol
            || !(0.0..=1.0).contains(&signal.confidence)
            || !(signal.price > 0.0 && signal.price.is_finite())
        {
            tracing::warn!(
                "Dropping malformed signal from {} for {}: {:?}",
                profile.strategy_id.name(),
                ctx.symbol,
                signal
            );
            return None;
        }

        let side = signal.direction.side();
        if !profile.direction.allows(side) {
            tracing::debug!(
                "{} {} signal filtered by {:?} bias",
                signal.symbol,
                side,
                profile.direction
            );
            return None;
        }

        Some(signal)
    }

    /// Size a signal into an entry intent. Zero quantity yields no intent.
    pub fn intent_from_signal(
        &self,
        signal: &Signal,
        profile: &StrategyProfile,
        created_at: DateTime<Utc>,
    ) -> Option<OrderIntent> {
        if !profile.enabled || signal.price <= 0.0 {
            return None;
        }

        let quantity = (self.config.base_notional * profile.size_multiplier / signal.price).floor();
        if quantity < 1.0 {
            tracing::debug!(
                "{} sized to zero (multiplier {:.3}, price {:.2})",
                signal.symbol,
                profile.size_multiplier,
                signal.price
            );
            return None;
        }

        Some(OrderIntent::new(
            signal.symbol.clone(),
            signal.direction.side(),
            quantity,
            signal.price,
            signal.confidence,
            OrderPurpose::Entry,
            created_at,
        ))
    }

    /// Route, generate and size in one step.
    pub fn decide(
        &self,
        classification: &RegimeClassification,
        ctx: &SignalContext<'_>,
    ) -> RouteDecision {
        let profile = self.route(classification, ctx.snapshot.volatility);
        let signal = self.evaluate(&profile, ctx);
        let intent = signal
            .as_ref()
            .and_then(|s| self.intent_from_signal(s, &profile, ctx.timestamp));

        RouteDecision {
            profile,
            signal,
            intent,
        }
    }
}

impl Default for StrategyRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}
