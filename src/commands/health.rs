use crate::market::types::FeedMode;
use crate::state::AppState;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub feed_mode: FeedMode,
    pub feed_error: Option<String>,
}

async fn probe_db(pool: &SqlitePool) -> &'static str {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    }
}

pub async fn build_health_response(started_at: Instant, state: &AppState) -> HealthResponse {
    let feed = state.feed.snapshot();
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        db: probe_db(&state.db_pool).await,
        feed_mode: feed.mode,
        feed_error: feed.last_error,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    build_health_response(state.started_at, state).await
}
