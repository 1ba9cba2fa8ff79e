use crate::error::AppError;
use crate::market::binance::{get_body, with_timeout};
use crate::market::cache::{CacheDocument, CacheStore};
use crate::market::persistence;
use crate::market::types::CoinMarket;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub const MARKETS_PAGE_SIZE: usize = 100;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Top coins by market cap, or only `ids` when given.
    async fn markets(&self, ids: Option<&[String]>) -> Result<Vec<CoinMarket>, AppError>;
}

pub fn markets_endpoint(base_url: &str, ids: Option<&[String]>) -> String {
    let mut endpoint = format!(
        "{base_url}/api/v3/coins/markets?vs_currency=usd&order=market_cap_desc&per_page={MARKETS_PAGE_SIZE}&page=1&sparkline=true"
    );
    if let Some(ids) = ids.filter(|ids| !ids.is_empty()) {
        endpoint.push_str("&ids=");
        endpoint.push_str(&ids.join(","));
    }
    endpoint
}

#[derive(Debug, Clone)]
pub struct CoinGeckoMarkets {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl CoinGeckoMarkets {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MarketDataSource for CoinGeckoMarkets {
    async fn markets(&self, ids: Option<&[String]>) -> Result<Vec<CoinMarket>, AppError> {
        let endpoint = markets_endpoint(&self.base_url, ids);
        debug!(endpoint = %endpoint, "fetching coin markets");
        let mut body = with_timeout(self.timeout, get_body(&self.client, &endpoint)).await?;
        Ok(simd_json::serde::from_slice(body.as_mut_slice())?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketBoardState {
    pub markets: Vec<CoinMarket>,
    pub watchlist: Vec<CoinMarket>,
    pub favorites: Vec<String>,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

/// Market list and watchlist with cache-first loading. Network failures keep the
/// last good lists and surface through `last_error`.
pub struct MarketBoard {
    source: Arc<dyn MarketDataSource>,
    cache: CacheStore,
    pool: SqlitePool,
    state: Arc<watch::Sender<MarketBoardState>>,
    refresh_lock: Mutex<()>,
}

impl MarketBoard {
    pub fn new(source: Arc<dyn MarketDataSource>, cache: CacheStore, pool: SqlitePool) -> Self {
        let (sender, _) = watch::channel(MarketBoardState::default());
        Self {
            source,
            cache,
            pool,
            state: Arc::new(sender),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MarketBoardState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> MarketBoardState {
        self.state.borrow().clone()
    }

    /// Paints whatever the local cache holds. Never touches the network.
    pub async fn load_cached(&self) -> Result<MarketBoardState, AppError> {
        let favorites = persistence::list_favorites(&self.pool).await?;
        let markets: Option<Vec<CoinMarket>> = self.cache.read(CacheDocument::Markets).await;
        let watchlist: Option<Vec<CoinMarket>> = if favorites.is_empty() {
            None
        } else {
            self.cache.read(CacheDocument::Watchlist).await
        };

        info!(
            markets = markets.as_ref().map(Vec::len).unwrap_or(0),
            watchlist = watchlist.as_ref().map(Vec::len).unwrap_or(0),
            "loaded cached market board"
        );

        self.state.send_modify(|state| {
            if let Some(markets) = markets {
                state.markets = markets;
            }
            if let Some(watchlist) = watchlist {
                state.watchlist = watchlist;
            }
            state.favorites = favorites;
        });
        Ok(self.snapshot())
    }

    pub async fn refresh_markets(&self) -> MarketBoardState {
        let _guard = self.refresh_lock.lock().await;
        self.state.send_modify(|state| state.is_loading = true);

        match self.source.markets(None).await {
            Ok(markets) => {
                if let Err(error) = self.cache.write(CacheDocument::Markets, &markets).await {
                    warn!(error = %error, "failed to cache market list");
                }
                self.state.send_modify(|state| {
                    state.markets = markets;
                    state.is_loading = false;
                    state.last_error = None;
                });
            }
            Err(error) => {
                warn!(error = %error, "market list refresh failed");
                self.state.send_modify(|state| {
                    state.is_loading = false;
                    state.last_error = Some(error.to_string());
                });
            }
        }

        self.snapshot()
    }

    pub async fn refresh_watchlist(&self) -> Result<MarketBoardState, AppError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_watchlist_locked().await
    }

    async fn refresh_watchlist_locked(&self) -> Result<MarketBoardState, AppError> {
        let favorites = persistence::list_favorites(&self.pool).await?;

        if favorites.is_empty() {
            self.state.send_modify(|state| {
                state.watchlist.clear();
                state.favorites.clear();
                state.is_loading = false;
                state.last_error = None;
            });
            if let Err(error) = self.cache.remove(CacheDocument::Watchlist).await {
                warn!(error = %error, "failed to drop cached watchlist");
                return Err(error);
            }
            return Ok(self.snapshot());
        }

        self.state.send_modify(|state| {
            state.favorites = favorites.clone();
            state.is_loading = true;
        });

        match self.source.markets(Some(favorites.as_slice())).await {
            Ok(watchlist) => {
                if let Err(error) = self.cache.write(CacheDocument::Watchlist, &watchlist).await {
                    warn!(error = %error, "failed to cache watchlist");
                }
                self.state.send_modify(|state| {
                    state.watchlist = watchlist;
                    state.is_loading = false;
                    state.last_error = None;
                });
            }
            Err(error) => {
                warn!(favorites = favorites.len(), error = %error, "watchlist refresh failed");
                self.state.send_modify(|state| {
                    state.is_loading = false;
                    state.last_error = Some(error.to_string());
                });
            }
        }

        Ok(self.snapshot())
    }

    /// Flips the favorite flag, then refetches the whole watchlist. Returns the new flag.
    pub async fn toggle_favorite(&self, coin_id: &str) -> Result<bool, AppError> {
        let _guard = self.refresh_lock.lock().await;
        let is_favorite = persistence::toggle_favorite(&self.pool, coin_id).await?;
        info!(coin_id = %coin_id, is_favorite, "favorite toggled");
        self.refresh_watchlist_locked().await?;
        Ok(is_favorite)
    }
}
