use crate::error::AppError;
use crate::market::persistence::{get_feed_preferences, save_feed_preferences};
use crate::market::types::{FeedInterval, FeedPreferencesSnapshot, FeedState, StartFeedArgs};
use crate::state::AppState;
use tracing::warn;

/// Missing arguments fall back to the feed's current selection.
pub async fn start_feed(
    state: &AppState,
    args: Option<StartFeedArgs>,
) -> Result<FeedState, AppError> {
    let selection = args
        .unwrap_or_default()
        .normalize(&state.current_selection())?;

    state
        .feed
        .start(&selection.symbol, selection.interval)
        .await?;
    remember_selection(state).await;
    Ok(state.feed.snapshot())
}

pub async fn select_feed_symbol(state: &AppState, symbol: String) -> Result<FeedState, AppError> {
    state.feed.select_symbol(&symbol).await?;
    remember_selection(state).await;
    Ok(state.feed.snapshot())
}

pub async fn select_feed_interval(
    state: &AppState,
    interval: FeedInterval,
) -> Result<FeedState, AppError> {
    state.feed.select_interval(interval).await;
    remember_selection(state).await;
    Ok(state.feed.snapshot())
}

pub async fn retry_feed(state: &AppState) -> FeedState {
    state.feed.retry().await;
    state.feed.snapshot()
}

pub async fn detach_feed(state: &AppState) -> FeedState {
    state.feed.detach().await;
    state.feed.snapshot()
}

pub fn feed_status(state: &AppState) -> FeedState {
    state.feed.snapshot()
}

pub async fn feed_preferences_get(state: &AppState) -> Result<FeedPreferencesSnapshot, AppError> {
    get_feed_preferences(&state.db_pool, &state.config.default_selection()).await
}

// A failed preference write never blocks the feed itself.
async fn remember_selection(state: &AppState) {
    if let Err(error) = save_feed_preferences(&state.db_pool, &state.current_selection()).await {
        warn!(error = %error, "failed to persist feed selection");
    }
}
