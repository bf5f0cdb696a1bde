use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use trading_core::{Fill, Side};

const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    /// Always positive; direction lives in `side`
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// +quantity for longs, -quantity for shorts
    pub fn signed_quantity(&self) -> f64 {
        self.side.sign() * self.quantity
    }

    pub fn market_value(&self) -> f64 {
        self.signed_quantity() * self.current_price
    }

    fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.avg_entry_price) * self.signed_quantity();
    }
}

/// Read-only view of the portfolio, published after every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: HashMap<String, Position>,
    pub last_prices: HashMap<String, f64>,
    pub initial_capital: f64,
    pub realized_pnl: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PortfolioSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Initial capital + realised + unrealised P&L
    pub fn equity(&self) -> f64 {
        self.initial_capital + self.realized_pnl + self.unrealized_pnl()
    }

    /// Sum of absolute position notionals
    pub fn gross_exposure(&self) -> f64 {
        self.positions.values().map(|p| p.market_value().abs()).sum()
    }

    pub fn signed_quantity(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.signed_quantity()).unwrap_or(0.0)
    }
}

/// What a fill did to the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillEffect {
    Opened,
    Increased,
    Reduced { realized: f64 },
    Closed { realized: f64 },
    Flipped { realized: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Invalid fill for {symbol}: quantity {quantity}, price {price}")]
    InvalidFill {
        symbol: String,
        quantity: f64,
        price: f64,
    },
}

/// Single-writer position book. Mutated only by confirmed fills and price marks.
#[derive(Debug)]
pub struct PositionStore {
    state: PortfolioSnapshot,
    publisher: watch::Sender<Arc<PortfolioSnapshot>>,
}

impl PositionStore {
    pub fn new(initial_capital: f64) -> Self {
        let state = PortfolioSnapshot {
            initial_capital,
            ..Default::default()
        };
        let (publisher, _) = watch::channel(Arc::new(state.clone()));
        Self { state, publisher }
    }

    /// Readers get a consistent snapshot per mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PortfolioSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> &PortfolioSnapshot {
        &self.state
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.state.positions.get(symbol)
    }

    /// Record the latest trade price and re-mark any open position.
    pub fn mark_price(&mut self, symbol: &str, price: f64, at: DateTime<Utc>) {
        if !(price > 0.0 && price.is_finite()) {
            return;
        }
        self.state.last_prices.insert(symbol.to_string(), price);
        if let Some(position) = self.state.positions.get_mut(symbol) {
            position.mark(price);
        }
        self.state.updated_at = Some(at);
        self.publish();
    }

    pub fn apply_fill(&mut self, fill: &Fill) -> Result<FillEffect, PositionError> {
        if !(fill.quantity > 0.0 && fill.quantity.is_finite() && fill.price > 0.0 && fill.price.is_finite()) {
            return Err(PositionError::InvalidFill {
                symbol: fill.symbol.clone(),
                quantity: fill.quantity,
                price: fill.price,
            });
        }

        let effect = match self.state.positions.remove(&fill.symbol) {
            None => {
                self.state.positions.insert(fill.symbol.clone(), opened(fill, fill.quantity));
                FillEffect::Opened
            }
            Some(mut position) if position.side == fill.side => {
                let total = position.quantity + fill.quantity;
                position.avg_entry_price =
                    (position.avg_entry_price * position.quantity + fill.price * fill.quantity) / total;
                position.quantity = total;
                position.mark(fill.price);
                self.state.positions.insert(fill.symbol.clone(), position);
                FillEffect::Increased
            }
            Some(mut position) => {
                let closing = fill.quantity.min(position.quantity);
                let realized = (fill.price - position.avg_entry_price) * closing * position.side.sign();
                self.state.realized_pnl += realized;

                let remaining = position.quantity - closing;
                let excess = fill.quantity - closing;

                if remaining > QTY_EPSILON {
                    position.quantity = remaining;
                    position.mark(fill.price);
                    self.state.positions.insert(fill.symbol.clone(), position);
                    FillEffect::Reduced { realized }
                } else if excess > QTY_EPSILON {
                    self.state.positions.insert(fill.symbol.clone(), opened(fill, excess));
                    FillEffect::Flipped { realized }
                } else {
                    FillEffect::Closed { realized }
                }
            }
        };

        self.state
            .last_prices
            .insert(fill.symbol.clone(), fill.price);
        self.state.updated_at = Some(fill.filled_at);
        self.publish();

        tracing::info!(
            "Applied fill {} {} {} @ {:.2}: {:?}",
            fill.side,
            fill.quantity,
            fill.symbol,
            fill.price,
            effect
        );
        Ok(effect)
    }

    fn publish(&self) {
        self.publisher.send_replace(Arc::new(self.state.clone()));
    }
}

fn opened(fill: &Fill, quantity: f64) -> Position {
    Position {
        symbol: fill.symbol.clone(),
        side: fill.side,
        quantity,
        avg_entry_price: fill.price,
        current_price: fill.price,
        unrealized_pnl: 0.0,
        opened_at: fill.filled_at,
    }
}
