use crate::error::AppError;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

pub const DEFAULT_INTERVAL: FeedInterval = FeedInterval::Day;
pub const LIVE_SEED_KLINE_CODE: &str = "1m";
pub const LIVE_SEED_LIMIT: u16 = 60;

pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

/// CoinGecko ids are lower-case slugs such as `bitcoin` or `usd-coin`.
pub fn normalize_coin_id(raw: &str) -> Result<String, AppError> {
    let coin_id = raw.trim().to_ascii_lowercase();
    if coin_id.is_empty() {
        return Err(AppError::InvalidArgument("coin id is required".to_string()));
    }
    if !coin_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        return Err(AppError::InvalidArgument(format!(
            "coin id '{coin_id}' contains unsupported characters"
        )));
    }
    Ok(coin_id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FeedInterval {
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "1w")]
    Week,
    #[serde(rename = "1m")]
    Month,
    #[serde(rename = "1y")]
    Year,
}

impl FeedInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Day => "1d",
            Self::Week => "1w",
            Self::Month => "1m",
            Self::Year => "1y",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "live" => Ok(Self::Live),
            "1d" => Ok(Self::Day),
            "1w" => Ok(Self::Week),
            "1m" => Ok(Self::Month),
            "1y" => Ok(Self::Year),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported feed interval '{other}'"
            ))),
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    /// Binance kline code and row count for the snapshot backing this selection.
    /// `Live` maps to the short seed window fetched before streaming starts.
    pub fn kline_request(self) -> (&'static str, u16) {
        match self {
            Self::Live => (LIVE_SEED_KLINE_CODE, LIVE_SEED_LIMIT),
            Self::Day => ("5m", 288),
            Self::Week => ("1h", 168),
            Self::Month => ("4h", 180),
            Self::Year => ("1d", 365),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    Idle,
    Historical,
    Live,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub timestamp_ms: i64,
    pub close: f64,
    pub volume: f64,
}

impl From<PricePoint> for Candle {
    fn from(value: PricePoint) -> Self {
        Self {
            timestamp_ms: value.timestamp_ms,
            close: value.price,
            volume: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedState {
    pub symbol: String,
    pub interval: FeedInterval,
    pub mode: FeedMode,
    pub is_loading: bool,
    pub last_error: Option<String>,
    pub series: Vec<Candle>,
}

impl FeedState {
    pub fn idle(symbol: String, interval: FeedInterval) -> Self {
        Self {
            symbol,
            interval,
            mode: FeedMode::Idle,
            is_loading: false,
            last_error: None,
            series: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedArgs {
    pub symbol: Option<String>,
    pub interval: Option<FeedInterval>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSelection {
    pub symbol: String,
    pub interval: FeedInterval,
}

impl StartFeedArgs {
    pub fn normalize(self, fallback: &FeedSelection) -> Result<FeedSelection, AppError> {
        let symbol = match self.symbol {
            Some(raw) => normalize_symbol(&raw)?,
            None => fallback.symbol.clone(),
        };

        Ok(FeedSelection {
            symbol,
            interval: self.interval.unwrap_or(fallback.interval),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedPreferencesSnapshot {
    pub symbol: String,
    pub interval: FeedInterval,
    pub updated_at_ms: i64,
}

#[derive(Debug, Deserialize)]
pub struct TradeTickWire {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "p")]
    pub price: String,
}

impl TryFrom<TradeTickWire> for PricePoint {
    type Error = AppError;

    fn try_from(value: TradeTickWire) -> Result<Self, Self::Error> {
        let price = value.price.parse::<f64>()?;
        if !price.is_finite() || price <= 0.0 {
            return Err(AppError::Decode(
                "trade price must be finite and positive".to_string(),
            ));
        }

        Ok(Self {
            timestamp_ms: value.event_time,
            price,
        })
    }
}

pub fn parse_trade_payload(payload: &mut [u8]) -> Result<PricePoint, AppError> {
    let wire: TradeTickWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KlineCell {
    Int(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

impl KlineCell {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(value) => value.parse::<i64>().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Int(value) => *value as f64,
            Self::Float(value) => *value,
            Self::Text(value) => value.parse::<f64>().ok()?,
            Self::Other(_) => return None,
        };
        value.is_finite().then_some(value)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KlineRow {
    Cells(Vec<KlineCell>),
    Other(IgnoredAny),
}

impl KlineRow {
    /// Positional layout: `[openTime, open, high, low, close, volume, ...]`.
    fn to_candle(&self) -> Option<Candle> {
        let Self::Cells(cells) = self else {
            return None;
        };
        if cells.len() < 6 {
            return None;
        }

        let timestamp_ms = cells[0].as_i64()?;
        let close = cells[4].as_f64()?;
        let volume = cells[5].as_f64()?.max(0.0);

        Some(Candle {
            timestamp_ms,
            close,
            volume,
        })
    }
}

/// Decodes a kline batch, skipping rows that do not parse. Only a payload that is
/// not a JSON array at all is an error.
pub fn parse_kline_rows(payload: &mut [u8]) -> Result<Vec<Candle>, AppError> {
    let rows: Vec<KlineRow> = simd_json::serde::from_slice(payload)?;
    Ok(rows.iter().filter_map(KlineRow::to_candle).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SparklineWire {
    #[serde(default)]
    pub price: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoinMarket {
    pub id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub market_cap_rank: Option<u32>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<f64>,
    #[serde(default)]
    pub sparkline_in_7d: Option<SparklineWire>,
}
