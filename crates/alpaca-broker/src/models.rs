use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc, // Good til canceled
    Ioc, // Immediate or cancel
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    #[serde(rename = "qty")]
    pub quantity: Option<String>,
    #[serde(rename = "filled_qty")]
    pub filled_quantity: Option<String>,
    pub filled_avg_price: Option<String>,
    pub side: String,
    pub status: String,
}

/// Error body returned with non-2xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

/// One element of a market-data stream frame (frames are JSON arrays)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "T")]
pub enum StreamMessage {
    #[serde(rename = "t")]
    Trade {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "p")]
        price: f64,
        #[serde(rename = "s", default)]
        size: f64,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "success")]
    Success {
        #[serde(default)]
        msg: String,
    },
    #[serde(rename = "subscription")]
    Subscription {
        #[serde(default)]
        trades: Vec<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Other,
}
