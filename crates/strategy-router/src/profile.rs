use market_regime_detector::Regime;
use serde::{Deserialize, Serialize};
use trading_core::{Side, TakeProfitTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    TrendFollowing,
    MeanReversion,
    Disabled,
}

impl StrategyId {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyId::TrendFollowing => "trend_following",
            StrategyId::MeanReversion => "mean_reversion",
            StrategyId::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectionBias {
    LongOnly,
    ShortOnly,
    Both,
    None,
}

impl DirectionBias {
    pub fn allows(&self, side: Side) -> bool {
        match self {
            DirectionBias::LongOnly => side == Side::Buy,
            DirectionBias::ShortOnly => side == Side::Sell,
            DirectionBias::Both => true,
            DirectionBias::None => false,
        }
    }
}

/// Which signal generator is listened to, and at what size. Reselected every bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProfile {
    pub strategy_id: StrategyId,
    pub direction: DirectionBias,
    /// Final multiplier in [0, 1] after confidence and volatility adjustment
    pub size_multiplier: f64,
    pub stop_loss_pct: f64,
    /// Ordered by ascending `pct`
    pub take_profit_tiers: Vec<TakeProfitTier>,
    pub enabled: bool,
}

impl StrategyProfile {
    pub fn disabled() -> Self {
        Self {
            strategy_id: StrategyId::Disabled,
            direction: DirectionBias::None,
            size_multiplier: 0.0,
            stop_loss_pct: 0.0,
            take_profit_tiers: Vec::new(),
            enabled: false,
        }
    }

    /// Base (unadjusted) profile for a regime.
    pub fn for_regime(regime: Regime) -> Self {
        match regime {
            Regime::TrendingUp => Self::trend(DirectionBias::LongOnly, 1.0, 0.02, trend_tiers()),
            Regime::TrendingDown => Self::trend(DirectionBias::ShortOnly, 1.0, 0.02, trend_tiers()),
            Regime::VolatileTrendingUp => {
                Self::trend(DirectionBias::LongOnly, 0.5, 0.035, volatile_trend_tiers())
            }
            Regime::VolatileTrendingDown => {
                Self::trend(DirectionBias::ShortOnly, 0.5, 0.035, volatile_trend_tiers())
            }
            Regime::Ranging => Self {
                strategy_id: StrategyId::MeanReversion,
                direction: DirectionBias::Both,
                size_multiplier: 0.8,
                stop_loss_pct: 0.015,
                take_profit_tiers: vec![TakeProfitTier::new(0.01, 0.5), TakeProfitTier::new(0.02, 1.0)],
                enabled: true,
            },
            Regime::VolatileRanging => Self {
                strategy_id: StrategyId::MeanReversion,
                direction: DirectionBias::Both,
                size_multiplier: 0.4,
                stop_loss_pct: 0.025,
                take_profit_tiers: vec![TakeProfitTier::new(0.015, 0.5), TakeProfitTier::new(0.03, 1.0)],
                enabled: true,
            },
            Regime::Unknown => Self::disabled(),
        }
    }

    fn trend(direction: DirectionBias, size: f64, stop: f64, tiers: Vec<TakeProfitTier>) -> Self {
        Self {
            strategy_id: StrategyId::TrendFollowing,
            direction,
            size_multiplier: size,
            stop_loss_pct: stop,
            take_profit_tiers: tiers,
            enabled: true,
        }
    }
}

fn trend_tiers() -> Vec<TakeProfitTier> {
    vec![TakeProfitTier::new(0.03, 0.33), TakeProfitTier::new(0.06, 0.5)]
}

fn volatile_trend_tiers() -> Vec<TakeProfitTier> {
    vec![TakeProfitTier::new(0.05, 0.5), TakeProfitTier::new(0.10, 1.0)]
}
