use async_trait::async_trait;
use broker_trait::{BrokerError, MarketDataSource, TickStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use trading_core::Tick;

use crate::models::StreamMessage;

pub const ALPACA_IEX_DATA_WS: &str = "wss://stream.data.alpaca.markets/v2/iex";

/// Real-time trade prints from Alpaca's market-data stream.
pub struct AlpacaMarketData {
    api_key: String,
    api_secret: String,
    url: String,
}

impl AlpacaMarketData {
    pub fn new(api_key: String, api_secret: String, url: String) -> Self {
        Self {
            api_key,
            api_secret,
            url,
        }
    }
}

#[async_trait]
impl MarketDataSource for AlpacaMarketData {
    async fn connect(&self, symbols: &[String]) -> Result<TickStream, BrokerError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!("Connected to Alpaca market data ({})", self.url);

        // Authenticate
        let auth_msg = serde_json::json!({
            "action": "auth",
            "key": self.api_key,
            "secret": self.api_secret,
        });
        write
            .send(Message::Text(auth_msg.to_string()))
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        // Wait for auth response (the first frame is the connection greeting)
        let mut authenticated = false;
        while !authenticated {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("Alpaca data WS auth response: {}", text);
                    for msg in parse_frame(&text) {
                        match msg {
                            StreamMessage::Success { msg } if msg == "authenticated" => {
                                authenticated = true
                            }
                            StreamMessage::Error { code, msg } => {
                                return Err(BrokerError::Unauthorized(format!("{} ({})", msg, code)))
                            }
                            _ => {}
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BrokerError::Network(e.to_string())),
                None => return Err(BrokerError::Network("closed during auth".into())),
            }
        }

        // Subscribe to trades
        let sub_msg = serde_json::json!({ "action": "subscribe", "trades": symbols });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        tracing::info!("Subscribed to trades for {} symbols", symbols.len());

        let (tx, rx) = mpsc::channel::<Result<Tick, BrokerError>>(1024);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                for item in frame_to_ticks(&text) {
                                    let fatal = item.is_err();
                                    if tx.send(item).await.is_err() || fatal {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("Alpaca data WS connection closed");
                                return;
                            }
                            Some(Err(e)) => {
                                let _ = tx.send(Err(BrokerError::Network(e.to_string()))).await;
                                return;
                            }
                            _ => {}
                        }
                    }
                    _ = tx.closed() => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    fn source_name(&self) -> &str {
        "alpaca"
    }
}

fn parse_frame(text: &str) -> Vec<StreamMessage> {
    match serde_json::from_str::<Vec<StreamMessage>>(text) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::debug!("Ignoring unparseable Alpaca frame: {}", e);
            Vec::new()
        }
    }
}

/// Trades in a frame become ticks; a stream error message ends the stream.
pub(crate) fn frame_to_ticks(text: &str) -> Vec<Result<Tick, BrokerError>> {
    let mut out = Vec::new();
    for msg in parse_frame(text) {
        match msg {
            StreamMessage::Trade {
                symbol,
                price,
                size,
                timestamp,
            } => out.push(Ok(Tick {
                symbol,
                price,
                volume: size,
                timestamp,
            })),
            StreamMessage::Error { code, msg } => {
                out.push(Err(BrokerError::Network(format!("stream error {}: {}", code, msg))));
                break;
            }
            StreamMessage::Subscription { trades } => {
                tracing::debug!("Alpaca data WS subscription: {:?}", trades);
            }
            StreamMessage::Success { msg } => {
                tracing::debug!("Alpaca data WS status: {}", msg);
            }
            StreamMessage::Other => {}
        }
    }
    out
}
