use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("endpoint blocked for this region (http {status})")]
    RegionBlocked { status: u16 },
    #[error("unexpected http status {status}")]
    Status { status: u16 },
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("stream closed: {0}")]
    StreamClosed(String),
    #[error("all price sources failed: {0}")]
    AllSourcesFailed(String),
}

impl AppError {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            403 | 451 => Self::RegionBlocked {
                status: status.as_u16(),
            },
            other => Self::Status { status: other },
        }
    }

    pub fn is_region_blocked(&self) -> bool {
        matches!(self, Self::RegionBlocked { .. })
    }

    /// Errors that justify a single retry against the secondary REST endpoint.
    /// Transport failures and timeouts are not region specific and go straight to backoff.
    pub fn should_failover(&self) -> bool {
        matches!(self, Self::RegionBlocked { .. } | Self::Status { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn classifies_geo_block_statuses_as_region_blocked() {
        assert!(AppError::from_status(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS).is_region_blocked());
        assert!(AppError::from_status(StatusCode::FORBIDDEN).is_region_blocked());
        assert!(!AppError::from_status(StatusCode::BAD_GATEWAY).is_region_blocked());
    }

    #[test]
    fn only_http_status_failures_trigger_failover() {
        assert!(AppError::RegionBlocked { status: 451 }.should_failover());
        assert!(AppError::Status { status: 500 }.should_failover());
        assert!(!AppError::Timeout { after_ms: 10_000 }.should_failover());
        assert!(!AppError::Decode("bad".to_string()).should_failover());
    }
}
