use crate::config::AppConfig;
use crate::db::initialize_pool;
use crate::error::AppError;
use crate::market::binance::BinanceTradeFeed;
use crate::market::board::{CoinGeckoMarkets, MarketBoard, MarketDataSource};
use crate::market::cache::CacheStore;
use crate::market::controller::FeedController;
use crate::market::persistence::get_feed_preferences;
use crate::market::poll::{CandleSource, PollSource};
use crate::market::spot::{PricePollerHandle, SpotPriceChain};
use crate::market::stream::TradeFeed;
use crate::market::types::FeedSelection;
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// External collaborators wired into `AppState`. Swapped for fakes in tests.
pub struct Sources {
    pub candles: Arc<dyn CandleSource>,
    pub trades: Arc<dyn TradeFeed>,
    pub markets: Arc<dyn MarketDataSource>,
    pub spot: SpotPriceChain,
}

impl Sources {
    pub fn from_config(config: &AppConfig, client: Client) -> Self {
        let timeout = config.request_timeout();
        Self {
            candles: Arc::new(PollSource::new(
                client.clone(),
                config.binance_rest_primary_url.clone(),
                config.binance_rest_secondary_url.clone(),
                timeout,
            )),
            trades: Arc::new(BinanceTradeFeed::new(config.binance_stream_url.clone())),
            markets: Arc::new(CoinGeckoMarkets::new(
                client.clone(),
                config.coingecko_api_url.clone(),
                timeout,
            )),
            spot: SpotPriceChain::standard(
                client,
                &config.coingecko_api_url,
                &config.binance_rest_primary_url,
                &config.coinbase_api_url,
                timeout,
            ),
        }
    }
}

pub struct AppState {
    pub started_at: Instant,
    pub config: AppConfig,
    pub db_pool: SqlitePool,
    pub feed: FeedController,
    pub board: MarketBoard,
    pub spot: SpotPriceChain,
    pub price_poller: Mutex<Option<PricePollerHandle>>,
}

impl AppState {
    pub async fn initialize(config: AppConfig) -> Result<Self, AppError> {
        let db_pool = initialize_pool(&config).await?;
        let sources = Sources::from_config(&config, Client::new());
        Self::from_parts(config, db_pool, sources).await
    }

    /// The feed starts out idle on the last saved selection.
    pub async fn from_parts(
        config: AppConfig,
        db_pool: SqlitePool,
        sources: Sources,
    ) -> Result<Self, AppError> {
        let preferences = get_feed_preferences(&db_pool, &config.default_selection()).await?;
        let feed = FeedController::new(
            sources.candles,
            sources.trades,
            config.feed_settings(),
            preferences.symbol,
            preferences.interval,
        );
        let board = MarketBoard::new(
            sources.markets,
            CacheStore::new(config.cache_dir()),
            db_pool.clone(),
        );

        Ok(Self {
            started_at: Instant::now(),
            config,
            db_pool,
            feed,
            board,
            spot: sources.spot,
            price_poller: Mutex::new(None),
        })
    }

    pub fn current_selection(&self) -> FeedSelection {
        let snapshot = self.feed.snapshot();
        FeedSelection {
            symbol: snapshot.symbol,
            interval: snapshot.interval,
        }
    }

    pub async fn shutdown(&self) {
        let poller = self.price_poller.lock().await.take();
        if let Some(handle) = poller {
            handle.stop().await;
        }
        self.feed.detach().await;
    }
}
