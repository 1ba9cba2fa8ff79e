pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

use commands::{
    feed::{feed_preferences_get, start_feed},
    markets::{markets_load_cached, markets_refresh, watchlist_refresh},
};
use config::AppConfig;
use error::AppError;
use market::types::{FeedMode, FeedState};
use state::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the process-wide subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coin_tracker_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn log_feed_state(feed: &FeedState) {
    let last_close = feed.series.last().map(|candle| candle.close);
    match &feed.last_error {
        Some(error) => warn!(
            symbol = %feed.symbol,
            interval = feed.interval.as_str(),
            mode = ?feed.mode,
            error = %error,
            "feed degraded"
        ),
        None => info!(
            symbol = %feed.symbol,
            interval = feed.interval.as_str(),
            mode = ?feed.mode,
            points = feed.series.len(),
            last_close = ?last_close,
            loading = feed.is_loading,
            "feed update"
        ),
    }
}

/// Headless session: paint cached markets, resume the saved feed selection, then
/// follow feed updates until Ctrl-C.
pub async fn run_until_shutdown(config: AppConfig) -> Result<(), AppError> {
    let state = AppState::initialize(config).await?;

    let cached = markets_load_cached(&state).await?;
    info!(markets = cached.markets.len(), watchlist = cached.watchlist.len(), "cached board painted");

    let preferences = feed_preferences_get(&state).await?;
    info!(symbol = %preferences.symbol, interval = preferences.interval.as_str(), "resuming feed");
    let mut feed_updates = state.feed.subscribe();
    start_feed(&state, None).await?;

    let refreshed = markets_refresh(&state).await;
    if let Some(error) = refreshed.last_error.as_deref() {
        warn!(error = %error, "market list unavailable, showing cached data");
    }
    watchlist_refresh(&state).await?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(error = %error, "ctrl-c handler failed");
                }
                break;
            }
            changed = feed_updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let feed = feed_updates.borrow_and_update().clone();
                if feed.mode != FeedMode::Idle {
                    log_feed_state(&feed);
                }
            }
        }
    }

    info!("shutting down");
    state.shutdown().await;
    Ok(())
}

pub fn run() -> Result<(), AppError> {
    init_tracing();
    let config = AppConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_until_shutdown(config))
}
