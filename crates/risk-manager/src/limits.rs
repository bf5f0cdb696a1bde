use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use trading_core::{ConfigError, OrderIntent, RiskCheckType, RiskRejection};

use crate::store::PortfolioSnapshot;

const RETURN_HISTORY: usize = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarLimit {
    /// e.g. 0.95 for 95% VaR
    pub confidence: f64,
    /// Largest tolerated one-bar loss at `confidence`, in currency
    pub max_loss: f64,
    /// Aligned return samples required before the check applies
    pub min_samples: usize,
}

impl Default for VarLimit {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            max_loss: 2_000.0,
            min_samples: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_symbol_notional: f64,
    pub max_gross_exposure: f64,
    /// Largest share of equity in one symbol or one sector
    pub max_concentration: f64,
    /// Largest |order price - last trade| / last trade
    pub max_price_deviation: f64,
    pub var: Option<VarLimit>,
    /// Overrides for the built-in sector table
    #[serde(default)]
    pub sectors: HashMap<String, String>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_symbol_notional: 25_000.0,
            max_gross_exposure: 100_000.0,
            max_concentration: 0.35,
            max_price_deviation: 0.05,
            var: None,
            sectors: HashMap::new(),
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("max_symbol_notional", self.max_symbol_notional),
            ("max_gross_exposure", self.max_gross_exposure),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::invalid(field, format!("must be positive, got {}", value)));
            }
        }
        if !(self.max_concentration > 0.0 && self.max_concentration <= 1.0) {
            return Err(ConfigError::invalid(
                "max_concentration",
                format!("must be in (0, 1], got {}", self.max_concentration),
            ));
        }
        if !(self.max_price_deviation > 0.0 && self.max_price_deviation < 1.0) {
            return Err(ConfigError::invalid(
                "max_price_deviation",
                format!("must be in (0, 1), got {}", self.max_price_deviation),
            ));
        }
        if let Some(var) = &self.var {
            if !(var.confidence > 0.5 && var.confidence < 1.0) {
                return Err(ConfigError::invalid("var.confidence", "must be in (0.5, 1)"));
            }
            if !(var.max_loss > 0.0) {
                return Err(ConfigError::invalid("var.max_loss", "must be positive"));
            }
            if var.min_samples < 2 {
                return Err(ConfigError::invalid("var.min_samples", "must be at least 2"));
            }
        }
        Ok(())
    }

    /// Sector used for concentration. Unlisted symbols are their own sector.
    pub fn sector_of<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.sectors
            .get(symbol)
            .map(String::as_str)
            .or_else(|| symbol_to_sector(symbol))
            .unwrap_or(symbol)
    }
}

/// Per-symbol bar returns for historical-simulation VaR.
#[derive(Debug, Clone, Default)]
pub struct ReturnHistory {
    returns: HashMap<String, VecDeque<f64>>,
}

impl ReturnHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, symbol: &str, ret: f64) {
        if !ret.is_finite() {
            return;
        }
        let series = self.returns.entry(symbol.to_string()).or_default();
        series.push_back(ret);
        while series.len() > RETURN_HISTORY {
            series.pop_front();
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.returns.get(symbol).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.returns.values().all(VecDeque::is_empty)
    }

    /// One-bar loss at `confidence` for the given signed notionals; None if too little history.
    pub fn value_at_risk(
        &self,
        exposures: &HashMap<String, f64>,
        confidence: f64,
        min_samples: usize,
    ) -> Option<f64> {
        let active: Vec<(&VecDeque<f64>, f64)> = exposures
            .iter()
            .filter(|(_, notional)| notional.abs() > 0.0)
            .map(|(symbol, notional)| (self.returns.get(symbol), *notional))
            .map(|(series, notional)| series.map(|s| (s, notional)))
            .collect::<Option<Vec<_>>>()?;

        if active.is_empty() {
            return Some(0.0);
        }

        let samples = active.iter().map(|(s, _)| s.len()).min().unwrap_or(0);
        if samples < min_samples {
            return None;
        }

        // Align on the most recent `samples` returns of every series
        let pnl: Vec<f64> = (0..samples)
            .map(|i| {
                active
                    .iter()
                    .map(|(series, notional)| notional * series[series.len() - samples + i])
                    .sum()
            })
            .collect();

        let mut data = Data::new(pnl);
        Some((-data.quantile(1.0 - confidence)).max(0.0))
    }
}

/// Pre-trade limits, evaluated against the state the order would leave behind.
#[derive(Debug, Clone)]
pub struct PositionLimitGuard {
    limits: RiskLimits,
}

impl PositionLimitGuard {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Every breached limit, in evaluation order. Empty means approved.
    pub fn check(
        &self,
        intent: &OrderIntent,
        portfolio: &PortfolioSnapshot,
        returns: &ReturnHistory,
    ) -> Vec<RiskRejection> {
        let mut breaches = Vec::new();
        let symbol = intent.symbol.as_str();

        let last_price = portfolio.last_price(symbol);
        match last_price {
            None => breaches.push(RiskRejection::new(
                RiskCheckType::PriceDeviation,
                format!("no last trade price for {}", symbol),
            )),
            Some(last) => {
                let deviation = (intent.reference_price - last).abs() / last;
                if deviation > self.limits.max_price_deviation {
                    breaches.push(RiskRejection::new(
                        RiskCheckType::PriceDeviation,
                        format!(
                            "order price {:.2} deviates {:.2}% from last trade {:.2} (limit {:.2}%)",
                            intent.reference_price,
                            deviation * 100.0,
                            last,
                            self.limits.max_price_deviation * 100.0
                        ),
                    ));
                }
            }
        }

        let mark = last_price.unwrap_or(intent.reference_price);
        let current_qty = portfolio.signed_quantity(symbol);
        let prospective_qty = current_qty + intent.side.sign() * intent.quantity;

        // Orders that only shrink the position never breach exposure limits
        if prospective_qty.abs() <= current_qty.abs() && prospective_qty * current_qty >= 0.0 {
            return breaches;
        }

        let current_notional = current_qty.abs() * mark;
        let symbol_notional = prospective_qty.abs() * mark;
        if symbol_notional > self.limits.max_symbol_notional {
            breaches.push(RiskRejection::new(
                RiskCheckType::SymbolNotional,
                format!(
                    "{} notional {:.0} would exceed {:.0}",
                    symbol, symbol_notional, self.limits.max_symbol_notional
                ),
            ));
        }

        let gross = portfolio.gross_exposure() - current_notional + symbol_notional;
        if gross > self.limits.max_gross_exposure {
            breaches.push(RiskRejection::new(
                RiskCheckType::ExposureLimit,
                format!(
                    "gross exposure {:.0} would exceed {:.0}",
                    gross, self.limits.max_gross_exposure
                ),
            ));
        }

        let equity = portfolio.equity();
        if equity <= 0.0 {
            breaches.push(RiskRejection::new(
                RiskCheckType::Concentration,
                format!("equity {:.2} is not positive", equity),
            ));
        } else {
            let symbol_share = symbol_notional / equity;
            if symbol_share > self.limits.max_concentration {
                breaches.push(RiskRejection::new(
                    RiskCheckType::Concentration,
                    format!(
                        "{} would be {:.1}% of equity (limit {:.1}%)",
                        symbol,
                        symbol_share * 100.0,
                        self.limits.max_concentration * 100.0
                    ),
                ));
            } else {
                let sector = self.limits.sector_of(symbol);
                let sector_notional: f64 = portfolio
                    .positions
                    .values()
                    .filter(|p| p.symbol != symbol && self.limits.sector_of(&p.symbol) == sector)
                    .map(|p| p.market_value().abs())
                    .sum::<f64>()
                    + symbol_notional;
                let sector_share = sector_notional / equity;
                if sector_share > self.limits.max_concentration {
                    breaches.push(RiskRejection::new(
                        RiskCheckType::Concentration,
                        format!(
                            "sector '{}' would be {:.1}% of equity (limit {:.1}%)",
                            sector,
                            sector_share * 100.0,
                            self.limits.max_concentration * 100.0
                        ),
                    ));
                }
            }
        }

        if let Some(var_limit) = &self.limits.var {
            let mut exposures: HashMap<String, f64> = portfolio
                .positions
                .values()
                .map(|p| (p.symbol.clone(), p.market_value()))
                .collect();
            exposures.insert(symbol.to_string(), prospective_qty * mark);

            match returns.value_at_risk(&exposures, var_limit.confidence, var_limit.min_samples) {
                Some(var) if var > var_limit.max_loss => breaches.push(RiskRejection::new(
                    RiskCheckType::ValueAtRisk,
                    format!(
                        "{:.0}% VaR {:.0} would exceed {:.0}",
                        var_limit.confidence * 100.0,
                        var,
                        var_limit.max_loss
                    ),
                )),
                Some(_) => {}
                None => tracing::debug!("VaR check skipped for {}: not enough return history", symbol),
            }
        }

        breaches
    }
}

/// Map symbols to GICS-like sectors for concentration checks.
/// ETFs and unlisted symbols are left to stand alone.
fn symbol_to_sector(symbol: &str) -> Option<&'static str> {
    let sector = match symbol {
        // Technology
        "AAPL" | "MSFT" | "GOOGL" | "GOOG" | "META" | "NVDA" | "AMD" | "INTC" | "CRM"
        | "ORCL" | "ADBE" | "CSCO" | "AVGO" | "TXN" | "QCOM" | "IBM" | "AMAT" | "MU" => {
            "Technology"
        }
        // Consumer Discretionary
        "AMZN" | "TSLA" | "HD" | "NKE" | "SBUX" | "TGT" | "LOW" | "MCD" | "BKNG" => {
            "Consumer Discretionary"
        }
        // Communication
        "NFLX" | "DIS" | "CMCSA" | "T" | "VZ" | "TMUS" => "Communication",
        // Financials
        "JPM" | "BAC" | "WFC" | "GS" | "MS" | "C" | "BLK" | "SCHW" | "AXP" | "V" | "MA" => {
            "Financials"
        }
        // Healthcare
        "JNJ" | "UNH" | "PFE" | "ABBV" | "MRK" | "LLY" | "TMO" | "ABT" | "AMGN" => "Healthcare",
        // Consumer Staples
        "PG" | "KO" | "PEP" | "WMT" | "COST" => "Consumer Staples",
        // Energy
        "XOM" | "CVX" | "COP" | "SLB" | "EOG" | "OXY" => "Energy",
        // Industrials
        "BA" | "CAT" | "HON" | "UPS" | "RTX" | "GE" | "LMT" | "DE" => "Industrials",
        _ => return None,
    };
    Some(sector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trading_core::{CorrelationId, Fill, OrderPurpose, Side};

    use crate::store::PositionStore;

    fn intent(symbol: &str, side: Side, quantity: f64, price: f64) -> OrderIntent {
        OrderIntent::new(symbol, side, quantity, price, 0.8, OrderPurpose::Entry, Utc::now())
    }

    fn store_with(positions: &[(&str, Side, f64, f64)]) -> PositionStore {
        let mut store = PositionStore::new(100_000.0);
        for (symbol, side, qty, price) in positions {
            store
                .apply_fill(&Fill {
                    symbol: symbol.to_string(),
                    side: *side,
                    quantity: *qty,
                    price: *price,
                    correlation_id: CorrelationId::new(),
                    purpose: OrderPurpose::Entry,
                    filled_at: Utc::now(),
                })
                .unwrap();
        }
        store
    }

    fn kinds(breaches: &[RiskRejection]) -> Vec<RiskCheckType> {
        breaches.iter().map(|b| b.kind).collect()
    }

    #[test]
    fn missing_last_price_is_a_price_deviation() {
        let guard = PositionLimitGuard::new(RiskLimits::default());
        let store = PositionStore::new(100_000.0);
        let breaches = guard.check(&intent("SPY", Side::Buy, 1.0, 500.0), store.snapshot(), &ReturnHistory::new());
        assert_eq!(kinds(&breaches), vec![RiskCheckType::PriceDeviation]);
    }

    #[test]
    fn fat_finger_price_is_rejected() {
        let guard = PositionLimitGuard::new(RiskLimits::default());
        let mut store = PositionStore::new(100_000.0);
        store.mark_price("SPY", 500.0, Utc::now());
        let breaches = guard.check(&intent("SPY", Side::Buy, 1.0, 550.0), store.snapshot(), &ReturnHistory::new());
        assert_eq!(kinds(&breaches), vec![RiskCheckType::PriceDeviation]);
    }

    #[test]
    fn all_breaches_are_reported() {
        let limits = RiskLimits {
            max_symbol_notional: 10_000.0,
            max_gross_exposure: 20_000.0,
            ..Default::default()
        };
        let guard = PositionLimitGuard::new(limits);
        let store = store_with(&[("QQQ", Side::Buy, 30.0, 400.0)]);
        let mut store = store;
        store.mark_price("SPY", 500.0, Utc::now());

        let breaches = guard.check(&intent("SPY", Side::Buy, 40.0, 500.0), store.snapshot(), &ReturnHistory::new());
        assert_eq!(
            kinds(&breaches),
            vec![RiskCheckType::SymbolNotional, RiskCheckType::ExposureLimit]
        );
    }

    #[test]
    fn sector_concentration_counts_peers() {
        let limits = RiskLimits {
            max_concentration: 0.2,
            ..Default::default()
        };
        let guard = PositionLimitGuard::new(limits);
        let mut store = store_with(&[("AAPL", Side::Buy, 80.0, 200.0)]);
        store.mark_price("MSFT", 400.0, Utc::now());

        // MSFT alone is 10% but Technology would be 26%
        let breaches = guard.check(&intent("MSFT", Side::Buy, 25.0, 400.0), store.snapshot(), &ReturnHistory::new());
        assert_eq!(kinds(&breaches), vec![RiskCheckType::Concentration]);
        assert!(breaches[0].detail.contains("Technology"));
    }

    #[test]
    fn reducing_orders_skip_exposure_limits() {
        let limits = RiskLimits {
            max_symbol_notional: 1_000.0,
            ..Default::default()
        };
        let guard = PositionLimitGuard::new(limits);
        let store = store_with(&[("SPY", Side::Buy, 10.0, 500.0)]);
        let breaches = guard.check(&intent("SPY", Side::Sell, 10.0, 500.0), store.snapshot(), &ReturnHistory::new());
        assert!(breaches.is_empty());
    }

    #[test]
    fn value_at_risk_uses_historical_returns() {
        let limits = RiskLimits {
            var: Some(VarLimit {
                confidence: 0.95,
                max_loss: 500.0,
                min_samples: 20,
            }),
            ..Default::default()
        };
        let guard = PositionLimitGuard::new(limits);
        let mut store = PositionStore::new(100_000.0);
        store.mark_price("SPY", 100.0, Utc::now());

        let mut returns = ReturnHistory::new();
        for i in 0..40 {
            // Alternating +/-5% bars
            returns.push("SPY", if i % 2 == 0 { 0.05 } else { -0.05 });
        }

        // 20k long: 5% down bar loses 1000 > 500
        let breaches = guard.check(&intent("SPY", Side::Buy, 200.0, 100.0), store.snapshot(), &returns);
        assert_eq!(kinds(&breaches), vec![RiskCheckType::ValueAtRisk]);

        // 5k long: loses 250
        let breaches = guard.check(&intent("SPY", Side::Buy, 50.0, 100.0), store.snapshot(), &returns);
        assert!(breaches.is_empty());
    }

    #[test]
    fn value_at_risk_needs_min_samples() {
        let mut returns = ReturnHistory::new();
        for _ in 0..5 {
            returns.push("SPY", -0.1);
        }
        let exposures = HashMap::from([("SPY".to_string(), 10_000.0)]);
        assert_eq!(returns.value_at_risk(&exposures, 0.95, 30), None);
        assert!(returns.value_at_risk(&exposures, 0.95, 5).unwrap() > 999.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut returns = ReturnHistory::new();
        for _ in 0..400 {
            returns.push("SPY", 0.001);
        }
        assert_eq!(returns.len("SPY"), RETURN_HISTORY);
    }

    #[test]
    fn limits_validate() {
        assert!(RiskLimits::default().validate().is_ok());
        let bad = RiskLimits {
            max_concentration: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
