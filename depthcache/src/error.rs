use thiserror::Error;

/// Errors surfaced by the public API (`DepthCacheManager`).
///
/// Only these three variants ever cross the public API boundary — every
/// other failure mode (a bad snapshot, a continuity gap, a dropped
/// WebSocket) is recovered internally by re-requesting a refresh and never
/// reaches a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DepthCacheError {
    #[error("the depth_cache for market '{market}' is out of sync, please try again later")]
    OutOfSync { market: String },

    #[error("the depth_cache for market '{market}' does not exist")]
    NotFound { market: String },

    #[error("the depth_cache for market '{market}' is already stopped")]
    AlreadyStopped { market: String },
}

pub type Result<T> = std::result::Result<T, DepthCacheError>;

/// Internal failure modes. None of these are returned to a public-API
/// caller; the dispatcher and snapshot fetcher use them to decide whether
/// to request a refresh and to log a reason.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection stale for {0}ms")]
    StaleConnection(u64),

    #[error("pong timeout")]
    PongTimeout,

    #[error("used weight ceiling exceeded: {0}")]
    WeightCeilingExceeded(u32),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
