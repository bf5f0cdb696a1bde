use crate::models::*;
use async_trait::async_trait;
use broker_trait::{BrokerClient, BrokerError, BrokerOrderStatus, OrderAck, OrderReport};
use chrono::Utc;
use reqwest::{header, Client, Response, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use trading_core::{ApprovedOrder, CorrelationId, Side};

pub const PAPER_BASE_URL: &str = "https://paper-api.alpaca.markets";

pub struct AlpacaClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    attempt_timeout: Duration,
}

impl AlpacaClient {
    /// Create a new Alpaca client. Every request is bounded by `attempt_timeout`.
    pub fn new(
        api_key: String,
        secret_key: String,
        base_url: String,
        attempt_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .connect_timeout(attempt_timeout)
            .build()
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
            attempt_timeout,
        })
    }

    /// Get authorization headers
    fn auth_headers(&self) -> Result<header::HeaderMap, BrokerError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&self.api_key)
                .map_err(|_| BrokerError::Unauthorized("API key contains invalid header characters".into()))?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&self.secret_key)
                .map_err(|_| BrokerError::Unauthorized("Secret key contains invalid header characters".into()))?,
        );
        Ok(headers)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Response, BrokerError> {
        let response = builder
            .headers(self.auth_headers()?)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(error_from_status(status, retry_after, &body))
    }

    fn map_transport_error(&self, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout {
                after: self.attempt_timeout,
            }
        } else if e.is_decode() {
            BrokerError::Decode(e.to_string())
        } else {
            BrokerError::Network(e.to_string())
        }
    }

    async fn read_order(&self, response: Response) -> Result<OrderReport, BrokerError> {
        let order = response
            .json::<Order>()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        order_to_report(order)
    }

    /// Check if this client is connected to the paper trading environment
    pub fn is_paper(&self) -> bool {
        self.base_url.contains("paper-api")
    }

    /// Get the base URL (for logging/diagnostics)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Map a non-2xx Alpaca response onto the broker error taxonomy.
pub(crate) fn error_from_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> BrokerError {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string());
    let lower = message.to_lowercase();

    match status.as_u16() {
        429 => BrokerError::RateLimited { retry_after },
        401 => BrokerError::Unauthorized(message),
        403 if lower.contains("buying power") => BrokerError::InsufficientBuyingPower(message),
        403 => BrokerError::Rejected(message),
        404 | 422 if lower.contains("asset") || lower.contains("symbol") => {
            BrokerError::InvalidSymbol(message)
        }
        404 => BrokerError::NotFound(message),
        400 | 422 => BrokerError::InvalidOrder(message),
        code => BrokerError::Server {
            status: code,
            message,
        },
    }
}

fn format_qty(qty: f64) -> Result<String, BrokerError> {
    Decimal::try_from(qty)
        .map(|d| d.normalize().to_string())
        .map_err(|_| BrokerError::InvalidOrder(format!("quantity {} is not representable", qty)))
}

fn parse_decimal(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|s| Decimal::from_str(s).ok())
        .and_then(|d| d.to_f64())
}

fn parse_status(status: &str) -> BrokerOrderStatus {
    match status {
        "filled" => BrokerOrderStatus::Filled,
        "partially_filled" => BrokerOrderStatus::PartiallyFilled,
        "canceled" | "done_for_day" => BrokerOrderStatus::Canceled,
        "expired" => BrokerOrderStatus::Expired,
        "rejected" | "suspended" | "stopped" => BrokerOrderStatus::Rejected,
        "accepted" | "pending_new" | "accepted_for_bidding" | "calculated" => BrokerOrderStatus::Accepted,
        _ => BrokerOrderStatus::New,
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers: Alpaca types -> unified BrokerClient types
// ---------------------------------------------------------------------------

pub(crate) fn order_to_report(o: Order) -> Result<OrderReport, BrokerError> {
    let client_order_id = CorrelationId::from_str(&o.client_order_id).map_err(|_| {
        BrokerError::Decode(format!(
            "order {} has foreign client_order_id {}",
            o.id, o.client_order_id
        ))
    })?;
    let side = match o.side.as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => return Err(BrokerError::Decode(format!("unknown order side {}", other))),
    };

    Ok(OrderReport {
        broker_order_id: o.id,
        client_order_id,
        symbol: o.symbol,
        side,
        quantity: parse_decimal(o.quantity.as_deref()).unwrap_or(0.0),
        status: parse_status(&o.status),
        filled_qty: parse_decimal(o.filled_quantity.as_deref()).unwrap_or(0.0),
        filled_avg_price: parse_decimal(o.filled_avg_price.as_deref()),
        updated_at: o.updated_at.unwrap_or(o.created_at),
        reject_reason: None,
    })
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    async fn submit_order(&self, order: &ApprovedOrder) -> Result<OrderAck, BrokerError> {
        let url = format!("{}/v2/orders", self.base_url);
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            qty: format_qty(order.quantity)?,
            side: match order.side {
                Side::Buy => OrderSide::Buy,
                Side::Sell => OrderSide::Sell,
            },
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            client_order_id: order.correlation_id.to_string(),
        };

        tracing::info!("Submitting order to Alpaca: {:?}", request);
        let response = self.send(self.client.post(&url).json(&request)).await?;
        let report = self.read_order(response).await?;
        tracing::info!("Order submitted successfully: {}", report.broker_order_id);

        Ok(OrderAck {
            broker_order_id: report.broker_order_id,
            client_order_id: report.client_order_id,
            status: report.status,
            submitted_at: Utc::now(),
        })
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<OrderReport, BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, broker_order_id);
        let response = self.send(self.client.get(&url)).await?;
        self.read_order(response).await
    }

    async fn find_order(
        &self,
        client_order_id: &CorrelationId,
    ) -> Result<Option<OrderReport>, BrokerError> {
        let url = format!("{}/v2/orders:by_client_order_id", self.base_url);
        let builder = self
            .client
            .get(&url)
            .query(&[("client_order_id", client_order_id.to_string())]);
        match self.send(builder).await {
            Ok(response) => self.read_order(response).await.map(Some),
            Err(BrokerError::NotFound(_)) | Err(BrokerError::InvalidSymbol(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, broker_order_id);
        self.send(self.client.delete(&url)).await?;
        tracing::info!("Order {} canceled successfully", broker_order_id);
        Ok(())
    }

    fn is_paper(&self) -> bool {
        self.is_paper()
    }

    fn broker_name(&self) -> &str {
        "alpaca"
    }
}
