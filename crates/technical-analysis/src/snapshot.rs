use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use trading_core::{Bar, ConfigError, IndicatorSnapshot, TrendDirection};

use crate::atr::AtrTracker;
use crate::indicators::{adx, last_sma, range_efficiency};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// Bars retained for the rolling computations
    pub history: usize,
    pub adx_period: usize,
    pub atr_period: usize,
    pub volatility_ma_period: usize,
    pub short_ma_period: usize,
    pub long_ma_period: usize,
    /// Relative MA gap below which direction is Flat
    pub flat_band: f64,
    pub volume_ma_period: usize,
    pub structure_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            history: 120,
            adx_period: 14,
            atr_period: 14,
            volatility_ma_period: 20,
            short_ma_period: 10,
            long_ma_period: 30,
            flat_band: 0.001,
            volume_ma_period: 20,
            structure_window: 20,
        }
    }
}

impl IndicatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adx_period == 0 || self.atr_period == 0 || self.volatility_ma_period == 0 {
            return Err(ConfigError::invalid("indicator_periods", "periods must be positive"));
        }
        if self.short_ma_period == 0 || self.short_ma_period >= self.long_ma_period {
            return Err(ConfigError::invalid(
                "short_ma_period",
                format!(
                    "must be positive and below long_ma_period ({} >= {})",
                    self.short_ma_period, self.long_ma_period
                ),
            ));
        }
        let needed = (self.adx_period * 2 + 1).max(self.long_ma_period);
        if self.history < needed {
            return Err(ConfigError::invalid(
                "history",
                format!("need at least {} bars, got {}", needed, self.history),
            ));
        }
        if !(0.0..1.0).contains(&self.flat_band) {
            return Err(ConfigError::invalid("flat_band", "must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Per-symbol rolling indicator state. Produces one snapshot per completed bar.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    bars: VecDeque<Bar>,
    atr: AtrTracker,
    volatility: VecDeque<f64>,
    bars_seen: usize,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            atr: AtrTracker::new(config.atr_period),
            bars: VecDeque::with_capacity(config.history),
            volatility: VecDeque::with_capacity(config.volatility_ma_period),
            bars_seen: 0,
            config,
        }
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Current ATR, once warm.
    pub fn atr(&self) -> Option<f64> {
        self.atr.value()
    }

    pub fn on_bar(&mut self, bar: Bar) -> IndicatorSnapshot {
        let atr = self.atr.update(bar.high, bar.low, bar.close);

        self.bars.push_back(bar);
        while self.bars.len() > self.config.history {
            self.bars.pop_front();
        }
        self.bars_seen += 1;

        let bars: Vec<Bar> = self.bars.iter().cloned().collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let last = &bars[bars.len() - 1];

        let volatility = match atr {
            Some(value) if last.close > 0.0 => value / last.close,
            _ => 0.0,
        };
        if atr.is_some() {
            self.volatility.push_back(volatility);
            while self.volatility.len() > self.config.volatility_ma_period {
                self.volatility.pop_front();
            }
        }
        let volatility_ma = if self.volatility.is_empty() {
            0.0
        } else {
            self.volatility.iter().sum::<f64>() / self.volatility.len() as f64
        };

        let trend_strength = adx(&bars, self.config.adx_period)
            .adx
            .last()
            .copied()
            .unwrap_or(0.0);

        let short_ma = last_sma(&closes, self.config.short_ma_period);
        let long_ma = last_sma(&closes, self.config.long_ma_period);
        let (trend_direction, ma_separation, price_deviation) = match (short_ma, long_ma) {
            (Some(short), Some(long)) if long > 0.0 => {
                let gap = (short - long) / long;
                let direction = if gap > self.config.flat_band {
                    TrendDirection::Up
                } else if gap < -self.config.flat_band {
                    TrendDirection::Down
                } else {
                    TrendDirection::Flat
                };
                (direction, gap.abs(), (last.close - long) / long)
            }
            _ => (TrendDirection::Flat, 0.0, 0.0),
        };

        let volume_ratio = match last_sma(&volumes, self.config.volume_ma_period) {
            Some(avg) if avg > 0.0 => last.volume / avg,
            _ => 0.0,
        };

        let window = self.config.structure_window.min(closes.len());
        let price_structure = range_efficiency(&closes[closes.len() - window..]);

        IndicatorSnapshot {
            trend_strength,
            volatility,
            volatility_ma,
            trend_direction,
            volume_ratio,
            ma_separation,
            price_structure,
            price_deviation,
            sample_size: self.bars_seen,
            timestamp: last.timestamp,
        }
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new(IndicatorConfig::default())
    }
}
