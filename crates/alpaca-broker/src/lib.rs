pub mod client;
pub mod models;
pub mod websocket;

pub use broker_trait::{BrokerClient, MarketDataSource};
pub use client::{AlpacaClient, PAPER_BASE_URL};
pub use websocket::{AlpacaMarketData, ALPACA_IEX_DATA_WS};
