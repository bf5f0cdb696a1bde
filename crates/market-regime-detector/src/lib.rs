use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use trading_core::{ConfigError, IndicatorSnapshot, TrendDirection};

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    /// Directional move up, volatility near its average
    TrendingUp,

    /// Directional move down, volatility near its average
    TrendingDown,

    /// Sideways movement, weak directional index
    Ranging,

    VolatileTrendingUp,
    VolatileTrendingDown,
    VolatileRanging,

    /// Unable to classify (insufficient data)
    Unknown,
}

impl Regime {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Regime::TrendingUp => "Trending Up",
            Regime::TrendingDown => "Trending Down",
            Regime::Ranging => "Ranging",
            Regime::VolatileTrendingUp => "Volatile Trending Up",
            Regime::VolatileTrendingDown => "Volatile Trending Down",
            Regime::VolatileRanging => "Volatile Ranging",
            Regime::Unknown => "Unknown",
        }
    }

    pub fn is_trending(&self) -> bool {
        matches!(
            self,
            Regime::TrendingUp
                | Regime::TrendingDown
                | Regime::VolatileTrendingUp
                | Regime::VolatileTrendingDown
        )
    }

    pub fn is_ranging(&self) -> bool {
        matches!(self, Regime::Ranging | Regime::VolatileRanging)
    }

    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            Regime::VolatileTrendingUp | Regime::VolatileTrendingDown | Regime::VolatileRanging
        )
    }
}

/// Regime detection result with confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    /// Raw label, reported even while transitioning
    pub regime: Regime,
    pub confidence: f64,
    pub is_transitioning: bool,
    /// `confidence >= confidence_floor`
    pub is_reliable: bool,
    pub timestamp: DateTime<Utc>,
    pub reasoning: String,
}

impl RegimeClassification {
    pub fn unknown(timestamp: DateTime<Utc>, reasoning: impl Into<String>) -> Self {
        Self {
            regime: Regime::Unknown,
            confidence: 0.0,
            is_transitioning: false,
            is_reliable: false,
            timestamp,
            reasoning: reasoning.into(),
        }
    }

    /// The regime downstream sizing should act on: `Unknown` while transitioning.
    pub fn effective_regime(&self) -> Regime {
        if self.is_transitioning {
            Regime::Unknown
        } else {
            self.regime
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Trend strength above this is trending
    pub trend_upper: f64,
    /// Trend strength below this is ranging
    pub trend_lower: f64,
    /// Volatility ratio above this promotes to the volatile variant
    pub volatility_multiplier: f64,
    /// Classifications kept for transition detection
    pub history_window: usize,
    /// Label change rate above which the regime is transitioning
    pub transition_threshold: f64,
    pub confidence_floor: f64,
    /// Bars required before classifying at all
    pub min_samples: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_upper: 25.0,
            trend_lower: 20.0,
            volatility_multiplier: 1.5,
            history_window: 10,
            transition_threshold: 0.4,
            confidence_floor: 0.5,
            min_samples: 30,
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.trend_lower > 0.0 && self.trend_lower < self.trend_upper) {
            return Err(ConfigError::invalid(
                "trend_lower",
                format!(
                    "must satisfy 0 < trend_lower < trend_upper (got {} / {})",
                    self.trend_lower, self.trend_upper
                ),
            ));
        }
        if !(self.volatility_multiplier > 1.0) {
            return Err(ConfigError::invalid(
                "volatility_multiplier",
                format!("must be > 1.0 (got {})", self.volatility_multiplier),
            ));
        }
        if self.history_window < 2 {
            return Err(ConfigError::invalid("history_window", "must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.transition_threshold) {
            return Err(ConfigError::invalid("transition_threshold", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(ConfigError::invalid("confidence_floor", "must be in [0, 1]"));
        }
        Ok(())
    }
}

// Confidence weights
const W_TREND: f64 = 0.40;
const W_VOLATILITY: f64 = 0.25;
const W_SEPARATION: f64 = 0.20;
const W_VOLUME: f64 = 0.10;
const W_STRUCTURE: f64 = 0.05;

/// MA separation treated as fully decisive
const FULL_SEPARATION: f64 = 0.02;

/// Trend component ceiling inside the threshold band
const BAND_TREND_CAP: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Trending(TrendDirection),
    Ranging,
}

/// Per-symbol regime detector. Owns the bounded classification history.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    config: RegimeConfig,
    history: VecDeque<Regime>,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_window),
            config,
        }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    pub fn history(&self) -> impl Iterator<Item = &Regime> {
        self.history.iter()
    }

    /// Classify the latest snapshot. Never fails: missing data degrades to `Unknown`.
    pub fn classify(&mut self, snapshot: &IndicatorSnapshot) -> RegimeClassification {
        if snapshot.sample_size < self.config.min_samples {
            let reason = format!(
                "Insufficient data: {} bars (need {})",
                snapshot.sample_size, self.config.min_samples
            );
            debug!("{}", reason);
            return RegimeClassification::unknown(snapshot.timestamp, reason);
        }
        if !snapshot.is_finite() {
            debug!("Non-finite indicator snapshot at {}", snapshot.timestamp);
            return RegimeClassification::unknown(snapshot.timestamp, "Non-finite indicator input");
        }

        let ts = snapshot.trend_strength;
        let ratio = snapshot.volatility_ratio();
        let volatile = ratio > self.config.volatility_multiplier;

        let (family, trend_component) = self.family(snapshot);
        let regime = match (family, volatile) {
            (Family::Trending(TrendDirection::Down), false) => Regime::TrendingDown,
            (Family::Trending(TrendDirection::Down), true) => Regime::VolatileTrendingDown,
            (Family::Trending(_), false) => Regime::TrendingUp,
            (Family::Trending(_), true) => Regime::VolatileTrendingUp,
            (Family::Ranging, false) => Regime::Ranging,
            (Family::Ranging, true) => Regime::VolatileRanging,
        };

        let trending = matches!(family, Family::Trending(_));
        let volatility_component = self.volatility_component(ratio, volatile);
        let separation = clamp01(snapshot.ma_separation / FULL_SEPARATION);
        let separation_component = if trending {
            0.5 + 0.5 * separation
        } else {
            1.0 - separation
        };
        let volume_component = if trending {
            clamp01(snapshot.volume_ratio - 0.5)
        } else {
            clamp01(1.5 - snapshot.volume_ratio)
        };
        let structure_component = if trending {
            clamp01(snapshot.price_structure)
        } else {
            1.0 - clamp01(snapshot.price_structure)
        };

        let confidence = clamp01(
            W_TREND * trend_component
                + W_VOLATILITY * volatility_component
                + W_SEPARATION * separation_component
                + W_VOLUME * volume_component
                + W_STRUCTURE * structure_component,
        );

        self.history.push_back(regime);
        while self.history.len() > self.config.history_window {
            self.history.pop_front();
        }
        let change_rate = self.change_rate();
        let is_transitioning = change_rate > self.config.transition_threshold;
        let is_reliable = confidence >= self.config.confidence_floor;

        let reasoning = format!(
            "{} (trend strength: {:.1}, vol ratio: {:.2}, separation: {:.2}%, volume: {:.2}, efficiency: {:.2}, change rate: {:.2})",
            regime.name(),
            ts,
            ratio,
            snapshot.ma_separation * 100.0,
            snapshot.volume_ratio,
            snapshot.price_structure,
            change_rate
        );

        if is_reliable {
            debug!("{} confidence {:.2}", reasoning, confidence);
        } else {
            debug!(
                "Unreliable classification {} (confidence {:.2} < floor {:.2})",
                reasoning, confidence, self.config.confidence_floor
            );
        }

        RegimeClassification {
            regime,
            confidence,
            is_transitioning,
            is_reliable,
            timestamp: snapshot.timestamp,
            reasoning,
        }
    }

    /// Pick the trending/ranging family and its trend-strength confidence component.
    fn family(&self, snapshot: &IndicatorSnapshot) -> (Family, f64) {
        let ts = snapshot.trend_strength;
        let upper = self.config.trend_upper;
        let lower = self.config.trend_lower;
        let band = upper - lower;

        // Flat MAs fall back to the sign of the price deviation, then to the last trend seen
        let direction = match snapshot.trend_direction {
            TrendDirection::Flat if snapshot.price_deviation > 0.0 => TrendDirection::Up,
            TrendDirection::Flat if snapshot.price_deviation < 0.0 => TrendDirection::Down,
            TrendDirection::Flat => self.last_trend_direction().unwrap_or(TrendDirection::Flat),
            other => other,
        };

        if ts > upper {
            if direction == TrendDirection::Flat {
                return (Family::Ranging, BAND_TREND_CAP * clamp01((upper - ts) / band));
            }
            let component = 0.5 + 0.5 * clamp01((ts - upper) / (0.2 * upper));
            return (Family::Trending(direction), component);
        }
        if ts < lower {
            return (Family::Ranging, 0.5 + 0.5 * clamp01((lower - ts) / (0.5 * lower)));
        }

        // Inside the band: stick with the last known family
        let last_trending = self
            .history
            .iter()
            .rev()
            .find(|r| **r != Regime::Unknown)
            .map(|r| r.is_trending())
            .unwrap_or(false);

        if last_trending && direction != TrendDirection::Flat {
            (
                Family::Trending(direction),
                BAND_TREND_CAP * clamp01((ts - lower) / band),
            )
        } else {
            (Family::Ranging, BAND_TREND_CAP * clamp01((upper - ts) / band))
        }
    }

    fn last_trend_direction(&self) -> Option<TrendDirection> {
        self.history.iter().rev().find_map(|r| match r {
            Regime::TrendingUp | Regime::VolatileTrendingUp => Some(TrendDirection::Up),
            Regime::TrendingDown | Regime::VolatileTrendingDown => Some(TrendDirection::Down),
            _ => None,
        })
    }

    fn volatility_component(&self, ratio: f64, volatile: bool) -> f64 {
        let mult = self.config.volatility_multiplier;
        if volatile {
            0.5 + 0.5 * clamp01((ratio - mult) / mult)
        } else {
            0.5 + 0.5 * clamp01((mult - ratio) / (mult - 1.0))
        }
    }

    /// Label changes per adjacent pair in the history window.
    fn change_rate(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let changes = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .filter(|(a, b)| a != b)
            .count();
        changes as f64 / (self.history.len() - 1) as f64
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(RegimeConfig::default())
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
