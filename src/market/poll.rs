use crate::error::AppError;
use crate::market::binance::{get_body, klines_endpoint, with_timeout};
use crate::market::series::Series;
use crate::market::types::{parse_kline_rows, FeedInterval};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Pulls one full snapshot for `symbol` at `interval`, time-ascending and at most
    /// `capacity` long.
    async fn fetch(
        &self,
        symbol: &str,
        interval: FeedInterval,
        capacity: usize,
    ) -> Result<Series, AppError>;
}

/// Binance kline puller with a single failover to a secondary base URL. Holds no
/// state across calls.
#[derive(Debug, Clone)]
pub struct PollSource {
    client: Client,
    primary_base_url: String,
    secondary_base_url: String,
    timeout: Duration,
}

impl PollSource {
    pub fn new(
        client: Client,
        primary_base_url: impl Into<String>,
        secondary_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            primary_base_url: primary_base_url.into(),
            secondary_base_url: secondary_base_url.into(),
            timeout,
        }
    }

    async fn fetch_from(
        &self,
        base_url: &str,
        symbol: &str,
        interval: FeedInterval,
        capacity: usize,
    ) -> Result<Series, AppError> {
        let (kline_code, limit) = interval.kline_request();
        let endpoint = klines_endpoint(base_url, symbol, kline_code, limit);
        debug!(endpoint = %endpoint, "fetching klines");

        let mut body = with_timeout(self.timeout, get_body(&self.client, &endpoint)).await?;
        let candles = parse_kline_rows(body.as_mut_slice())?;
        Ok(Series::from_unordered(candles, capacity))
    }
}

#[async_trait]
impl CandleSource for PollSource {
    async fn fetch(
        &self,
        symbol: &str,
        interval: FeedInterval,
        capacity: usize,
    ) -> Result<Series, AppError> {
        match self
            .fetch_from(&self.primary_base_url, symbol, interval, capacity)
            .await
        {
            Ok(series) => Ok(series),
            Err(error) if error.should_failover() => {
                warn!(
                    symbol = %symbol,
                    interval = interval.as_str(),
                    error = %error,
                    "primary kline endpoint refused request, failing over"
                );
                self.fetch_from(&self.secondary_base_url, symbol, interval, capacity)
                    .await
            }
            Err(error) => Err(error),
        }
    }
}
