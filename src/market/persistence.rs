use crate::error::AppError;
use crate::market::types::{
    normalize_coin_id, normalize_symbol, FeedInterval, FeedPreferencesSnapshot, FeedSelection,
};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub async fn list_favorites(pool: &SqlitePool) -> Result<Vec<String>, AppError> {
    let rows = sqlx::query("SELECT coin_id FROM favorites ORDER BY added_at_ms ASC, coin_id ASC")
        .fetch_all(pool)
        .await?;

    let mut favorites = Vec::with_capacity(rows.len());
    for row in rows {
        favorites.push(row.try_get("coin_id")?);
    }
    Ok(favorites)
}

pub async fn is_favorite(pool: &SqlitePool, coin_id: &str) -> Result<bool, AppError> {
    let coin_id = normalize_coin_id(coin_id)?;
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM favorites WHERE coin_id = ?")
        .bind(coin_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Flips membership and returns whether the coin is a favorite afterwards.
pub async fn toggle_favorite(pool: &SqlitePool, coin_id: &str) -> Result<bool, AppError> {
    let coin_id = normalize_coin_id(coin_id)?;
    let mut tx = pool.begin().await?;

    let removed = sqlx::query("DELETE FROM favorites WHERE coin_id = ?")
        .bind(&coin_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if removed == 0 {
        sqlx::query("INSERT INTO favorites (coin_id, added_at_ms) VALUES (?, ?)")
            .bind(&coin_id)
            .bind(now_unix_ms())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(removed == 0)
}

fn map_preferences_row(row: &sqlx::sqlite::SqliteRow) -> Result<FeedPreferencesSnapshot, AppError> {
    let interval_raw: String = row.try_get("interval")?;

    Ok(FeedPreferencesSnapshot {
        symbol: row.try_get("symbol")?,
        interval: FeedInterval::parse_str(&interval_raw)?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

async fn ensure_feed_preferences_seed(
    pool: &SqlitePool,
    defaults: &FeedSelection,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO feed_preferences (id, symbol, interval, updated_at_ms) VALUES (1, ?, ?, ?)",
    )
    .bind(&defaults.symbol)
    .bind(defaults.interval.as_str())
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_feed_preferences(
    pool: &SqlitePool,
    defaults: &FeedSelection,
) -> Result<FeedPreferencesSnapshot, AppError> {
    ensure_feed_preferences_seed(pool, defaults).await?;

    let row = sqlx::query("SELECT symbol, interval, updated_at_ms FROM feed_preferences WHERE id = 1")
        .fetch_one(pool)
        .await?;

    map_preferences_row(&row)
}

pub async fn save_feed_preferences(
    pool: &SqlitePool,
    selection: &FeedSelection,
) -> Result<FeedPreferencesSnapshot, AppError> {
    let symbol = normalize_symbol(&selection.symbol)?;

    sqlx::query(
        "INSERT INTO feed_preferences (id, symbol, interval, updated_at_ms) VALUES (1, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET symbol=excluded.symbol, interval=excluded.interval, updated_at_ms=excluded.updated_at_ms",
    )
    .bind(&symbol)
    .bind(selection.interval.as_str())
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    get_feed_preferences(pool, selection).await
}
