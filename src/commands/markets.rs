use crate::error::AppError;
use crate::market::board::MarketBoardState;
use crate::market::spot::{spawn_price_poller, PriceQuote, SpotAsset, SpotQuote};
use crate::state::AppState;
use serde::Deserialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAssetArgs {
    pub coin_id: String,
    pub ticker: String,
}

impl SpotAssetArgs {
    pub fn normalize(self) -> Result<SpotAsset, AppError> {
        SpotAsset::new(&self.coin_id, &self.ticker)
    }
}

pub async fn markets_load_cached(state: &AppState) -> Result<MarketBoardState, AppError> {
    state.board.load_cached().await
}

pub async fn markets_refresh(state: &AppState) -> MarketBoardState {
    state.board.refresh_markets().await
}

pub async fn watchlist_refresh(state: &AppState) -> Result<MarketBoardState, AppError> {
    state.board.refresh_watchlist().await
}

pub fn market_board_status(state: &AppState) -> MarketBoardState {
    state.board.snapshot()
}

pub async fn spot_price(state: &AppState, args: SpotAssetArgs) -> Result<SpotQuote, AppError> {
    let asset = args.normalize()?;
    state.spot.latest_price(&asset).await
}

/// Replaces any running poller. The receiver sees every published quote.
pub async fn price_poller_start(
    state: &AppState,
    args: SpotAssetArgs,
) -> Result<watch::Receiver<PriceQuote>, AppError> {
    let asset = args.normalize()?;

    let existing_handle = {
        let mut poller_slot = state.price_poller.lock().await;
        poller_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.stop().await;
    }

    let handle = spawn_price_poller(state.spot.clone(), asset, state.config.backoff_policy());
    let updates = handle.updates.clone();
    {
        let mut poller_slot = state.price_poller.lock().await;
        *poller_slot = Some(handle);
    }

    Ok(updates)
}

pub async fn price_poller_stop(state: &AppState) -> bool {
    let existing_handle = {
        let mut poller_slot = state.price_poller.lock().await;
        poller_slot.take()
    };

    match existing_handle {
        Some(handle) => {
            handle.stop().await;
            true
        }
        None => false,
    }
}
