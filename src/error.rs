use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid trade: {0}")]
    InvalidTrade(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("ordering anomaly: bucket {bucket_time} is behind last closed bar {last_time}")]
    OrderingAnomaly { bucket_time: i64, last_time: i64 },
    #[error("feed disconnected: {0}")]
    FeedDisconnected(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("no chart session is running")]
    SessionNotRunning,
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl AppError {
    /// Connectivity failures are the only ones surfaced for manual retry.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::FeedDisconnected(_) | Self::FetchFailed(_) | Self::Reqwest(_) | Self::WebSocket(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connectivity_failures() {
        assert!(AppError::FeedDisconnected("eof".to_string()).is_connectivity());
        assert!(AppError::FetchFailed("timeout".to_string()).is_connectivity());
        assert!(!AppError::InvalidPayload("empty".to_string()).is_connectivity());
        assert!(!AppError::SessionNotRunning.is_connectivity());
    }
}
