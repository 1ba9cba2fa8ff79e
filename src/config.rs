use crate::error::AppError;
use crate::market::backoff::BackoffPolicy;
use crate::market::controller::FeedSettings;
use crate::market::types::{normalize_symbol, FeedSelection, DEFAULT_INTERVAL};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "./coin-tracker-data";
pub const DEFAULT_DB_FILENAME: &str = "app.db";
pub const DEFAULT_BINANCE_REST_PRIMARY_URL: &str = "https://api.binance.com";
pub const DEFAULT_BINANCE_REST_SECONDARY_URL: &str = "https://api.binance.us";
pub const DEFAULT_BINANCE_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";
pub const DEFAULT_COINGECKO_API_URL: &str = "https://api.coingecko.com";
pub const DEFAULT_COINBASE_API_URL: &str = "https://api.coinbase.com";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 12_000;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
pub const DEFAULT_SERIES_CAPACITY: usize = 500;
pub const DEFAULT_THROTTLE_MS: u64 = 1_000;
pub const DEFAULT_STREAM_SPACING_MS: u64 = 1_000;
pub const DEFAULT_SYMBOL: &str = "BTCUSDT";

pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const MIN_BACKOFF_BASE_MS: u64 = 100;
pub const MAX_BACKOFF_BASE_MS: u64 = 60_000;
pub const MAX_BACKOFF_MAX_MS: u64 = 600_000;
pub const MIN_SERIES_CAPACITY: usize = 10;
pub const MAX_SERIES_CAPACITY: usize = 10_000;
pub const MIN_THROTTLE_MS: u64 = 50;
pub const MAX_THROTTLE_MS: u64 = 10_000;
pub const MAX_STREAM_SPACING_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_filename: String,
    pub binance_rest_primary_url: String,
    pub binance_rest_secondary_url: String,
    pub binance_stream_url: String,
    pub coingecko_api_url: String,
    pub coinbase_api_url: String,
    pub request_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub series_capacity: usize,
    pub throttle_ms: u64,
    pub stream_spacing_ms: u64,
    pub default_symbol: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            db_filename: DEFAULT_DB_FILENAME.to_string(),
            binance_rest_primary_url: DEFAULT_BINANCE_REST_PRIMARY_URL.to_string(),
            binance_rest_secondary_url: DEFAULT_BINANCE_REST_SECONDARY_URL.to_string(),
            binance_stream_url: DEFAULT_BINANCE_STREAM_URL.to_string(),
            coingecko_api_url: DEFAULT_COINGECKO_API_URL.to_string(),
            coinbase_api_url: DEFAULT_COINBASE_API_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            series_capacity: DEFAULT_SERIES_CAPACITY,
            throttle_ms: DEFAULT_THROTTLE_MS,
            stream_spacing_ms: DEFAULT_STREAM_SPACING_MS,
            default_symbol: DEFAULT_SYMBOL.to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> Result<T, AppError> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::InvalidArgument(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(fallback),
    }
}

fn trim_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            data_dir: env_string("APP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            db_filename: env_string("APP_DB_FILENAME").unwrap_or(defaults.db_filename),
            binance_rest_primary_url: env_string("BINANCE_REST_PRIMARY_URL")
                .unwrap_or(defaults.binance_rest_primary_url),
            binance_rest_secondary_url: env_string("BINANCE_REST_SECONDARY_URL")
                .unwrap_or(defaults.binance_rest_secondary_url),
            binance_stream_url: env_string("BINANCE_STREAM_URL")
                .unwrap_or(defaults.binance_stream_url),
            coingecko_api_url: env_string("COINGECKO_API_URL")
                .unwrap_or(defaults.coingecko_api_url),
            coinbase_api_url: env_string("COINBASE_API_URL").unwrap_or(defaults.coinbase_api_url),
            request_timeout_ms: env_parsed("APP_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            backoff_base_ms: env_parsed("APP_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: env_parsed("APP_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            series_capacity: env_parsed("APP_SERIES_CAPACITY", defaults.series_capacity)?,
            throttle_ms: env_parsed("APP_THROTTLE_MS", defaults.throttle_ms)?,
            stream_spacing_ms: env_parsed("APP_STREAM_SPACING_MS", defaults.stream_spacing_ms)?,
            default_symbol: env_string("APP_DEFAULT_SYMBOL").unwrap_or(defaults.default_symbol),
        };

        config.normalize()
    }

    pub fn normalize(self) -> Result<Self, AppError> {
        if self.db_filename.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "APP_DB_FILENAME must not be empty".to_string(),
            ));
        }

        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&self.request_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "APP_REQUEST_TIMEOUT_MS must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        if !(MIN_BACKOFF_BASE_MS..=MAX_BACKOFF_BASE_MS).contains(&self.backoff_base_ms) {
            return Err(AppError::InvalidArgument(format!(
                "APP_BACKOFF_BASE_MS must be between {MIN_BACKOFF_BASE_MS} and {MAX_BACKOFF_BASE_MS}"
            )));
        }

        if !(self.backoff_base_ms..=MAX_BACKOFF_MAX_MS).contains(&self.backoff_max_ms) {
            return Err(AppError::InvalidArgument(format!(
                "APP_BACKOFF_MAX_MS must be between APP_BACKOFF_BASE_MS and {MAX_BACKOFF_MAX_MS}"
            )));
        }

        if !(MIN_SERIES_CAPACITY..=MAX_SERIES_CAPACITY).contains(&self.series_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "APP_SERIES_CAPACITY must be between {MIN_SERIES_CAPACITY} and {MAX_SERIES_CAPACITY}"
            )));
        }

        if !(MIN_THROTTLE_MS..=MAX_THROTTLE_MS).contains(&self.throttle_ms) {
            return Err(AppError::InvalidArgument(format!(
                "APP_THROTTLE_MS must be between {MIN_THROTTLE_MS} and {MAX_THROTTLE_MS}"
            )));
        }

        if self.stream_spacing_ms > MAX_STREAM_SPACING_MS {
            return Err(AppError::InvalidArgument(format!(
                "APP_STREAM_SPACING_MS must be at most {MAX_STREAM_SPACING_MS}"
            )));
        }

        let default_symbol = normalize_symbol(&self.default_symbol)?;

        Ok(Self {
            binance_rest_primary_url: trim_base_url(self.binance_rest_primary_url),
            binance_rest_secondary_url: trim_base_url(self.binance_rest_secondary_url),
            binance_stream_url: trim_base_url(self.binance_stream_url),
            coingecko_api_url: trim_base_url(self.coingecko_api_url),
            coinbase_api_url: trim_base_url(self.coinbase_api_url),
            default_symbol,
            ..self
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_filename)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    /// Selection used before any preference has been saved.
    pub fn default_selection(&self) -> FeedSelection {
        FeedSelection {
            symbol: self.default_symbol.clone(),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            series_capacity: self.series_capacity,
            throttle_interval: Duration::from_millis(self.throttle_ms),
            stream_min_spacing: Duration::from_millis(self.stream_spacing_ms),
            backoff: self.backoff_policy(),
        }
    }
}
