use crate::error::AppError;
use crate::market::persistence::{is_favorite, list_favorites};
use crate::market::types::normalize_coin_id;
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteToggleResult {
    pub coin_id: String,
    pub is_favorite: bool,
}

pub async fn favorites_list(state: &AppState) -> Result<Vec<String>, AppError> {
    list_favorites(&state.db_pool).await
}

pub async fn favorite_status(state: &AppState, coin_id: String) -> Result<bool, AppError> {
    is_favorite(&state.db_pool, &coin_id).await
}

/// Toggles membership and refetches the whole watchlist before returning.
pub async fn favorite_toggle(
    state: &AppState,
    coin_id: String,
) -> Result<FavoriteToggleResult, AppError> {
    let coin_id = normalize_coin_id(&coin_id)?;
    let is_favorite = state.board.toggle_favorite(&coin_id).await?;
    Ok(FavoriteToggleResult {
        coin_id,
        is_favorite,
    })
}
