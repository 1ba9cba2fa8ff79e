use crate::error::AppError;
use crate::market::stream::{TradeFeed, TradeFrames};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

pub fn ws_endpoint(stream_base_url: &str, symbol: &str) -> String {
    format!("{stream_base_url}/{}@aggTrade", symbol.to_ascii_lowercase())
}

pub fn klines_endpoint(rest_base_url: &str, symbol: &str, kline_code: &str, limit: u16) -> String {
    format!("{rest_base_url}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={kline_code}&limit={limit}",
            symbol.to_ascii_uppercase()
        )
}

pub fn ticker_price_endpoint(rest_base_url: &str, symbol: &str) -> String {
    format!("{rest_base_url}/api/v3/ticker/price")
        + &format!("?symbol={}", symbol.to_ascii_uppercase())
}

/// Runs one HTTP attempt under a hard deadline; hitting the deadline is an ordinary failure.
pub async fn with_timeout<T, F>(timeout: Duration, attempt: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout {
            after_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
        }),
    }
}

/// GET returning the raw body, mapping non-2xx statuses through `AppError::from_status`.
pub async fn get_body(client: &Client, endpoint: &str) -> Result<Vec<u8>, AppError> {
    let response = client.get(endpoint).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::from_status(status));
    }
    Ok(response.bytes().await?.to_vec())
}

pub async fn connect_trade_stream(
    stream_base_url: &str,
    symbol: &str,
) -> Result<TradeFrames, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(1 << 20),
        max_frame_size: Some(1 << 20),
        ..Default::default()
    };

    let request = ws_endpoint(stream_base_url, symbol);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    info!(symbol = %symbol, "trade stream connected");

    // Control frames are handled by tungstenite; a close frame ends the sequence.
    let frames = stream
        .take_while(|frame| {
            let open = !matches!(frame, Ok(Message::Close(_)));
            async move { open }
        })
        .filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text_payload)) => Some(Ok(text_payload.into_bytes())),
                Ok(Message::Binary(binary_payload)) => Some(Ok(binary_payload)),
                Ok(_) => None,
                Err(error) => Some(Err(AppError::from(error))),
            }
        });

    Ok(frames.boxed())
}

#[derive(Debug, Clone)]
pub struct BinanceTradeFeed {
    stream_base_url: String,
}

impl BinanceTradeFeed {
    pub fn new(stream_base_url: impl Into<String>) -> Self {
        Self {
            stream_base_url: stream_base_url.into(),
        }
    }
}

#[async_trait]
impl TradeFeed for BinanceTradeFeed {
    async fn connect(&self, symbol: &str) -> Result<TradeFrames, AppError> {
        debug!(symbol = %symbol, base = %self.stream_base_url, "opening trade stream");
        connect_trade_stream(&self.stream_base_url, symbol).await
    }
}
