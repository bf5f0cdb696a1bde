use strategy_router::{SignalContext, SignalGenerator, StrategyId};
use trading_core::{Signal, SignalDirection, TrendDirection};

/// Trend strength at which trend confidence saturates
const FULL_TREND_STRENGTH: f64 = 50.0;

/// Follows the moving-average direction once the trend index confirms it.
#[derive(Debug, Clone)]
pub struct TrendFollower {
    /// Minimum trend strength (ADX) to emit anything
    pub min_trend_strength: f64,
}

impl Default for TrendFollower {
    fn default() -> Self {
        Self {
            min_trend_strength: 20.0,
        }
    }
}

impl SignalGenerator for TrendFollower {
    fn strategy_id(&self) -> StrategyId {
        StrategyId::TrendFollowing
    }

    fn generate(&self, ctx: &SignalContext<'_>) -> Option<Signal> {
        let snap = ctx.snapshot;
        if snap.trend_strength < self.min_trend_strength {
            return None;
        }

        let direction = match snap.trend_direction {
            TrendDirection::Up if snap.price_deviation > 0.0 => SignalDirection::Long,
            TrendDirection::Down if snap.price_deviation < 0.0 => SignalDirection::Short,
            _ => return None,
        };

        let strength = (snap.trend_strength / FULL_TREND_STRENGTH).min(1.0);
        let confidence = (0.5 * strength + 0.5 * snap.price_structure.clamp(0.0, 1.0)).clamp(0.0, 1.0);

        Some(Signal {
            symbol: ctx.symbol.to_string(),
            direction,
            confidence,
            price: ctx.price,
            timestamp: ctx.timestamp,
        })
    }
}

/// Fades stretches away from the long moving average.
#[derive(Debug, Clone)]
pub struct BandReverter {
    /// |price deviation| that triggers a fade
    pub entry_deviation: f64,
}

impl Default for BandReverter {
    fn default() -> Self {
        Self {
            entry_deviation: 0.015,
        }
    }
}

impl SignalGenerator for BandReverter {
    fn strategy_id(&self) -> StrategyId {
        StrategyId::MeanReversion
    }

    fn generate(&self, ctx: &SignalContext<'_>) -> Option<Signal> {
        let deviation = ctx.snapshot.price_deviation;
        if deviation.abs() < self.entry_deviation {
            return None;
        }

        let direction = if deviation < 0.0 {
            SignalDirection::Long
        } else {
            SignalDirection::Short
        };
        let confidence = (deviation.abs() / (2.0 * self.entry_deviation)).clamp(0.0, 1.0);

        Some(Signal {
            symbol: ctx.symbol.to_string(),
            direction,
            confidence,
            price: ctx.price,
            timestamp: ctx.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trading_core::IndicatorSnapshot;

    use super::*;

    fn snapshot(trend_strength: f64, direction: TrendDirection, deviation: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            trend_strength,
            volatility: 0.01,
            volatility_ma: 0.01,
            trend_direction: direction,
            volume_ratio: 1.0,
            ma_separation: 0.01,
            price_structure: 0.6,
            price_deviation: deviation,
            sample_size: 60,
            timestamp: Utc::now(),
        }
    }

    fn ctx(snap: &IndicatorSnapshot) -> SignalContext<'_> {
        SignalContext {
            symbol: "SPY",
            snapshot: snap,
            price: 500.0,
            timestamp: snap.timestamp,
        }
    }

    #[test]
    fn trend_follower_goes_with_the_trend() {
        let gen = TrendFollower::default();

        let up = snapshot(35.0, TrendDirection::Up, 0.01);
        let signal = gen.generate(&ctx(&up)).unwrap();
        assert_eq!(signal.direction, SignalDirection::Long);
        assert!(signal.confidence > 0.5 && signal.confidence <= 1.0);

        let down = snapshot(35.0, TrendDirection::Down, -0.01);
        assert_eq!(gen.generate(&ctx(&down)).unwrap().direction, SignalDirection::Short);
    }

    #[test]
    fn trend_follower_ignores_weak_or_contradicted_trends() {
        let gen = TrendFollower::default();
        assert!(gen.generate(&ctx(&snapshot(10.0, TrendDirection::Up, 0.01))).is_none());
        assert!(gen.generate(&ctx(&snapshot(35.0, TrendDirection::Up, -0.01))).is_none());
        assert!(gen.generate(&ctx(&snapshot(35.0, TrendDirection::Flat, 0.01))).is_none());
    }

    #[test]
    fn band_reverter_fades_stretches() {
        let gen = BandReverter::default();

        let stretched_down = snapshot(15.0, TrendDirection::Flat, -0.03);
        let signal = gen.generate(&ctx(&stretched_down)).unwrap();
        assert_eq!(signal.direction, SignalDirection::Long);
        assert_eq!(signal.confidence, 1.0);

        let stretched_up = snapshot(15.0, TrendDirection::Flat, 0.02);
        assert_eq!(gen.generate(&ctx(&stretched_up)).unwrap().direction, SignalDirection::Short);

        assert!(gen.generate(&ctx(&snapshot(15.0, TrendDirection::Flat, 0.005))).is_none());
    }
}
