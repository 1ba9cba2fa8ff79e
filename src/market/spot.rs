use crate::error::AppError;
use crate::market::backoff::{run_poll_loop, BackoffPolicy};
use crate::market::binance::{get_body, ticker_price_endpoint, with_timeout};
use crate::market::types::normalize_coin_id;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One asset as each price service names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAsset {
    pub coingecko_id: String,
    pub ticker: String,
}

impl SpotAsset {
    /// Both names end up in request URLs, so they are restricted to slug characters.
    pub fn new(coingecko_id: &str, ticker: &str) -> Result<Self, AppError> {
        let coingecko_id = normalize_coin_id(coingecko_id)?;
        let ticker = ticker.trim().to_ascii_uppercase();
        if ticker.is_empty() || !ticker.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(format!(
                "ticker '{ticker}' must be non-empty alphanumeric ASCII"
            )));
        }
        Ok(Self {
            coingecko_id,
            ticker,
        })
    }
}

#[async_trait]
pub trait SpotPriceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_price(&self, asset: &SpotAsset) -> Result<f64, AppError>;
}

fn finite_price(price: f64, source: &str) -> Result<f64, AppError> {
    if price.is_finite() && price > 0.0 {
        Ok(price)
    } else {
        Err(AppError::Decode(format!("{source} returned a non-positive price")))
    }
}

#[derive(Debug, Clone)]
pub struct CoinGeckoSpot {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl CoinGeckoSpot {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SpotPriceProvider for CoinGeckoSpot {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch_price(&self, asset: &SpotAsset) -> Result<f64, AppError> {
        let endpoint = format!(
            "{}/api/v3/simple/price?ids={}&vs_currencies=usd",
            self.base_url, asset.coingecko_id
        );
        let mut body = with_timeout(self.timeout, get_body(&self.client, &endpoint)).await?;
        let payload: HashMap<String, HashMap<String, f64>> =
            simd_json::serde::from_slice(body.as_mut_slice())?;
        let price = payload
            .get(&asset.coingecko_id)
            .and_then(|quotes| quotes.get("usd"))
            .copied()
            .ok_or_else(|| AppError::Decode(format!("no usd quote for {}", asset.coingecko_id)))?;
        finite_price(price, self.name())
    }
}

#[derive(Debug, Deserialize)]
struct BinanceTickerWire {
    price: String,
}

#[derive(Debug, Clone)]
pub struct BinanceSpot {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl BinanceSpot {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SpotPriceProvider for BinanceSpot {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_price(&self, asset: &SpotAsset) -> Result<f64, AppError> {
        let endpoint = ticker_price_endpoint(&self.base_url, &format!("{}USDT", asset.ticker));
        let mut body = with_timeout(self.timeout, get_body(&self.client, &endpoint)).await?;
        let payload: BinanceTickerWire = simd_json::serde::from_slice(body.as_mut_slice())?;
        finite_price(payload.price.parse::<f64>()?, self.name())
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpotWire {
    data: CoinbaseSpotDataWire,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpotDataWire {
    amount: String,
}

#[derive(Debug, Clone)]
pub struct CoinbaseSpot {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl CoinbaseSpot {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SpotPriceProvider for CoinbaseSpot {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn fetch_price(&self, asset: &SpotAsset) -> Result<f64, AppError> {
        let endpoint = format!("{}/v2/prices/{}-USD/spot", self.base_url, asset.ticker);
        let mut body = with_timeout(self.timeout, get_body(&self.client, &endpoint)).await?;
        let payload: CoinbaseSpotWire = simd_json::serde::from_slice(body.as_mut_slice())?;
        finite_price(payload.data.amount.parse::<f64>()?, self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotQuote {
    pub price: f64,
    pub source: &'static str,
}

/// Ordered fallback chain: the first provider to answer wins.
#[derive(Clone)]
pub struct SpotPriceChain {
    providers: Vec<Arc<dyn SpotPriceProvider>>,
}

impl SpotPriceChain {
    pub fn new(providers: Vec<Arc<dyn SpotPriceProvider>>) -> Self {
        Self { providers }
    }

    pub fn standard(
        client: Client,
        coingecko_url: &str,
        binance_url: &str,
        coinbase_url: &str,
        timeout: Duration,
    ) -> Self {
        let providers: Vec<Arc<dyn SpotPriceProvider>> = vec![
            Arc::new(CoinGeckoSpot::new(client.clone(), coingecko_url, timeout)),
            Arc::new(BinanceSpot::new(client.clone(), binance_url, timeout)),
            Arc::new(CoinbaseSpot::new(client, coinbase_url, timeout)),
        ];
        Self::new(providers)
    }

    pub async fn latest_price(&self, asset: &SpotAsset) -> Result<SpotQuote, AppError> {
        let mut failures = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            match provider.fetch_price(asset).await {
                Ok(price) => {
                    return Ok(SpotQuote {
                        price,
                        source: provider.name(),
                    })
                }
                Err(error) => {
                    debug!(source = provider.name(), asset = %asset.ticker, error = %error, "spot price tier failed");
                    failures.push(format!("{}: {error}", provider.name()));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no providers configured".to_string());
        }
        Err(AppError::AllSourcesFailed(failures.join("; ")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub price: Option<f64>,
    pub source: Option<String>,
    pub last_error: Option<String>,
    pub updated_at_ms: Option<i64>,
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub struct PricePollerHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub updates: watch::Receiver<PriceQuote>,
}

impl PricePollerHandle {
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
    }
}

/// Polls the fallback chain forever under `policy`, publishing every outcome. A failed
/// round keeps the last good price and records the error next to it.
pub fn spawn_price_poller(
    chain: SpotPriceChain,
    asset: SpotAsset,
    policy: BackoffPolicy,
) -> PricePollerHandle {
    let (sender, updates) = watch::channel(PriceQuote::default());
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();

    let join_handle = tokio::spawn(async move {
        let chain = &chain;
        let asset = &asset;
        let sender = &sender;
        let token = &task_token;
        run_poll_loop(policy, token, move || async move {
            let outcome = chain.latest_price(asset).await;
            if token.is_cancelled() {
                return ControlFlow::Break(());
            }

            match outcome {
                Ok(quote) => {
                    sender.send_modify(|current| {
                        current.price = Some(quote.price);
                        current.source = Some(quote.source.to_string());
                        current.last_error = None;
                        current.updated_at_ms = Some(now_unix_ms());
                    });
                    ControlFlow::Continue(true)
                }
                Err(error) => {
                    warn!(asset = %asset.ticker, error = %error, "spot price poll failed");
                    sender.send_modify(|current| {
                        current.last_error = Some(error.to_string());
                    });
                    ControlFlow::Continue(false)
                }
            }
        })
        .await;
    });

    PricePollerHandle {
        cancellation_token,
        join_handle,
        updates,
    }
}
