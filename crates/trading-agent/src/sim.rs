use std::time::Duration;

use async_trait::async_trait;
use broker_trait::{BrokerError, MarketDataSource, TickStream};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use trading_core::Tick;

/// Random-walk trade prints for paper runs without market-data credentials.
#[derive(Debug, Clone)]
pub struct RandomWalkSource {
    pub interval: Duration,
    pub start_price: f64,
    /// Per-step standard deviation as a fraction of price
    pub step_volatility: f64,
}

impl Default for RandomWalkSource {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            start_price: 100.0,
            step_volatility: 0.001,
        }
    }
}

struct WalkState {
    rng: StdRng,
    prices: Vec<(String, f64)>,
    next: usize,
}

#[async_trait]
impl MarketDataSource for RandomWalkSource {
    async fn connect(&self, symbols: &[String]) -> Result<TickStream, BrokerError> {
        if symbols.is_empty() {
            return Err(BrokerError::InvalidSymbol("no symbols to simulate".to_string()));
        }

        let state = WalkState {
            rng: StdRng::from_entropy(),
            prices: symbols.iter().map(|s| (s.clone(), self.start_price)).collect(),
            next: 0,
        };
        let interval = self.interval;
        let vol = self.step_volatility;

        let ticks = stream::unfold(state, move |mut state| async move {
            tokio::time::sleep(interval).await;

            let i = state.next % state.prices.len();
            state.next = state.next.wrapping_add(1);

            // Sum of uniforms approximates a normal step
            let shock: f64 = (0..4).map(|_| state.rng.gen_range(-1.0..1.0)).sum::<f64>() / 2.0;
            let volume = state.rng.gen_range(1.0..500.0_f64).round();
            let (symbol, price) = &mut state.prices[i];
            *price = (*price * (1.0 + vol * shock)).max(0.01);

            let tick = Tick {
                symbol: symbol.clone(),
                price: *price,
                volume,
                timestamp: Utc::now(),
            };
            Some((Ok(tick), state))
        });

        Ok(ticks.boxed())
    }

    fn source_name(&self) -> &str {
        "random-walk"
    }
}
