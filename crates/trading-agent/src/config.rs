use std::env;
use std::str::FromStr;
use std::time::Duration;

use alpaca_broker::{ALPACA_IEX_DATA_WS, PAPER_BASE_URL};
use execution_gateway::{FeedConfig, GatewayConfig, RateLimitConfig, RetryPolicy};
use market_regime_detector::RegimeConfig;
use risk_manager::{BreakerConfig, RiskLimits, StopConfig, StopDefaults, VarLimit};
use serde::{Deserialize, Serialize};
use strategy_router::RouterConfig;
use technical_analysis::IndicatorConfig;
use trading_core::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// In-process paper broker
    Paper,
    /// Alpaca REST API (paper or live endpoint)
    Alpaca,
}

impl FromStr for BrokerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Ok(BrokerMode::Paper),
            "alpaca" => Ok(BrokerMode::Alpaca),
            other => Err(format!("expected paper or alpaca, got {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub watchlist: Vec<String>,
    pub broker_mode: BrokerMode,

    // Alpaca
    pub alpaca_api_key: Option<String>,
    pub alpaca_secret_key: Option<String>,
    pub alpaca_base_url: String,
    pub alpaca_data_url: String,

    pub initial_capital: f64,
    pub bar_duration: Duration,

    pub indicators: IndicatorConfig,
    pub regime: RegimeConfig,
    pub router: RouterConfig,
    pub stops: StopDefaults,
    pub limits: RiskLimits,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub gateway: GatewayConfig,
    pub feed: FeedConfig,

    // Event journal
    pub journal_url: String,
}

impl AgentConfig {
    /// Load `.env`, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build and validate from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let atr_period: usize = env.parse("ATR_PERIOD", 14)?;
        let stop_kind = env.string("STOP_KIND", "static");
        let default_stop = match stop_kind.trim().to_ascii_lowercase().as_str() {
            "static" => StopConfig::Static {
                pct: env.parse("STOP_PCT", 0.02)?,
            },
            "trailing" => StopConfig::Trailing {
                pct: env.parse("TRAIL_PCT", 0.03)?,
            },
            "atr" => StopConfig::AtrBased {
                multiplier: env.parse("ATR_MULTIPLIER", 2.5)?,
            },
            "time" => StopConfig::TimeBased {
                max_duration: Duration::from_secs(env.parse::<u64>("MAX_HOLD_MINUTES", 390)? * 60),
            },
            other => {
                return Err(ConfigError::invalid(
                    "STOP_KIND",
                    format!("expected static, trailing, atr or time, got {}", other),
                ))
            }
        };

        let var = match env.get("MAX_VAR") {
            Some(raw) => Some(VarLimit {
                max_loss: parse_value("MAX_VAR", &raw)?,
                ..VarLimit::default()
            }),
            None => None,
        };

        let retry = RetryPolicy {
            max_attempts: Some(env.parse("RETRY_MAX_ATTEMPTS", 3)?),
            base_delay: Duration::from_millis(env.parse("RETRY_BASE_MS", 100)?),
            max_delay: Duration::from_millis(env.parse("RETRY_CAP_MS", 2000)?),
            ..RetryPolicy::order_submission()
        };

        let config = Self {
            watchlist: env
                .string("WATCHLIST", "SPY,QQQ")
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            broker_mode: env.parse("BROKER_MODE", BrokerMode::Paper)?,

            alpaca_api_key: env.get("ALPACA_API_KEY"),
            alpaca_secret_key: env.get("ALPACA_SECRET_KEY"),
            alpaca_base_url: env.string("ALPACA_BASE_URL", PAPER_BASE_URL),
            alpaca_data_url: env.string("ALPACA_DATA_URL", ALPACA_IEX_DATA_WS),

            initial_capital: env.parse("INITIAL_CAPITAL", 100_000.0)?,
            bar_duration: Duration::from_secs(env.parse("BAR_SECONDS", 60)?),

            indicators: IndicatorConfig {
                atr_period,
                ..IndicatorConfig::default()
            },
            regime: RegimeConfig {
                trend_upper: env.parse("TREND_UPPER", 25.0)?,
                trend_lower: env.parse("TREND_LOWER", 20.0)?,
                volatility_multiplier: env.parse("VOLATILITY_MULTIPLIER", 1.5)?,
                history_window: env.parse("REGIME_WINDOW", 10)?,
                transition_threshold: env.parse("TRANSITION_THRESHOLD", 0.4)?,
                confidence_floor: env.parse("CONFIDENCE_FLOOR", 0.5)?,
                ..RegimeConfig::default()
            },
            router: RouterConfig {
                target_volatility: env.parse("TARGET_VOLATILITY", 0.01)?,
                base_notional: env.parse("BASE_ORDER_NOTIONAL", 5_000.0)?,
            },
            stops: StopDefaults {
                default_stop: Some(default_stop),
                atr_period,
            },
            limits: RiskLimits {
                max_symbol_notional: env.parse("MAX_SYMBOL_NOTIONAL", 25_000.0)?,
                max_gross_exposure: env.parse("MAX_GROSS_EXPOSURE", 100_000.0)?,
                max_concentration: env.parse("MAX_CONCENTRATION", 0.35)?,
                max_price_deviation: env.parse("MAX_PRICE_DEVIATION", 0.05)?,
                var,
                ..RiskLimits::default()
            },
            breaker: BreakerConfig {
                failure_threshold: env.parse("BREAKER_FAILURES", 5)?,
                open_duration: Duration::from_secs(env.parse("BREAKER_OPEN_SECS", 30)?),
            },
            rate_limit: RateLimitConfig {
                per_minute: env.parse("RATE_LIMIT_PER_MIN", 180)?,
                burst: env.parse("RATE_LIMIT_BURST", 10)?,
                ..RateLimitConfig::default()
            },
            gateway: GatewayConfig {
                attempt_timeout: Duration::from_millis(env.parse("ATTEMPT_TIMEOUT_MS", 500)?),
                retry,
                ..GatewayConfig::default()
            },
            feed: FeedConfig {
                stale_after: Duration::from_secs(env.parse("FEED_STALE_SECS", 15)?),
                heartbeat_interval: Duration::from_secs(env.parse("HEARTBEAT_SECS", 5)?),
                ..FeedConfig::default()
            },

            journal_url: env.string("JOURNAL_URL", "sqlite:execution_journal.db"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchlist.is_empty() {
            return Err(ConfigError::invalid("WATCHLIST", "at least one symbol is required"));
        }
        if !(self.initial_capital > 0.0 && self.initial_capital.is_finite()) {
            return Err(ConfigError::invalid("INITIAL_CAPITAL", "must be positive"));
        }
        if self.bar_duration.is_zero() {
            return Err(ConfigError::invalid("BAR_SECONDS", "must be positive"));
        }
        if self.broker_mode == BrokerMode::Alpaca {
            if self.alpaca_api_key.is_none() {
                return Err(ConfigError::Missing("ALPACA_API_KEY".to_string()));
            }
            if self.alpaca_secret_key.is_none() {
                return Err(ConfigError::Missing("ALPACA_SECRET_KEY".to_string()));
            }
        }

        self.indicators.validate()?;
        self.regime.validate()?;
        self.router.validate()?;
        self.stops.validate()?;
        self.limits.validate()?;
        self.breaker.validate()?;
        self.rate_limit.validate()?;
        self.gateway.validate()?;
        self.feed.validate()?;
        Ok(())
    }

    /// Orders would reach a live (real money) account.
    pub fn is_live(&self) -> bool {
        self.broker_mode == BrokerMode::Alpaca
            && self.alpaca_base_url.trim_end_matches('/') != PAPER_BASE_URL
    }

    /// Market data comes from Alpaca whenever credentials are present.
    pub fn has_alpaca_credentials(&self) -> bool {
        self.alpaca_api_key.is_some() && self.alpaca_secret_key.is_some()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `key`
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("{:?}: {}", raw, e)))
}
