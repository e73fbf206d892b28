use std::time::Duration;

/// Which Binance-style market flavor a `DepthCacheManager` talks to.
///
/// The two flavors disagree on how a diff event proves it continues the
/// previous one, and on which REST endpoint and stream naming scheme apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeFlavor {
    /// `api.binance.com` spot market. Continuity: `U == last_update_id + 1`.
    Spot,
    /// `fapi.binance.com` USDT-margined futures. Continuity: `pu == last_update_id`.
    LinearFutures,
}

impl ExchangeFlavor {
    pub fn default_rest_base_url(&self) -> &'static str {
        match self {
            ExchangeFlavor::Spot => "https://api.binance.com",
            ExchangeFlavor::LinearFutures => "https://fapi.binance.com",
        }
    }

    pub fn default_ws_base_url(&self) -> &'static str {
        match self {
            ExchangeFlavor::Spot => "wss://stream.binance.com:9443",
            ExchangeFlavor::LinearFutures => "wss://fstream.binance.com",
        }
    }
}

/// Configuration for a `DepthCacheManager`.
#[derive(Debug, Clone)]
pub struct DepthCacheConfig {
    /// Spot vs. linear futures; governs continuity checks and default URLs.
    pub exchange: ExchangeFlavor,

    /// Override for the REST snapshot base URL. Defaults to the exchange's
    /// standard endpoint when `None`.
    pub base_rest_url: Option<String>,

    /// Override for the WebSocket stream base URL. Defaults to the
    /// exchange's standard endpoint when `None`.
    pub base_ws_url: Option<String>,

    /// Default proactive re-anchor period for a newly created cache, used
    /// when `create_depthcache` isn't given an explicit per-call override.
    /// `None` means a synchronized cache is never proactively re-anchored --
    /// only gaps and disconnects trigger a refresh.
    pub default_refresh_interval: Option<Duration>,

    /// Appended to the subscription channel name as `depth@{N}ms`. `None`
    /// subscribes at the exchange's default update cadence.
    pub depth_cache_update_interval_ms: Option<u64>,

    /// Bypasses the Init Gate entirely: every refresh request is admitted
    /// immediately, at the cost of the caller accepting the risk of
    /// exceeding the exchange's REST rate limits during a disconnect storm.
    pub high_performance: bool,

    /// Global minimum gap between two admitted snapshot refreshes, across
    /// every market on this manager, enforced by the Init Gate.
    pub init_interval: Duration,

    /// Minimum gap between two admitted snapshot refreshes for the *same*
    /// market, enforced by the Init Gate.
    pub init_time_window: Duration,

    /// WebSocket idle-read timeout before a connection is considered stale
    /// and torn down.
    pub websocket_close_timeout: Duration,

    /// Interval at which a ping frame is sent on each open connection.
    pub websocket_ping_interval: Duration,

    /// How long to wait for a pong before treating a connection as dead.
    pub websocket_ping_timeout: Duration,

    /// `used_weight` ceiling above which the snapshot fetcher backs off
    /// before issuing another REST request, to avoid tripping the
    /// exchange's rate limiter.
    pub used_weight_ceiling: u32,

    /// Maximum number of individual market streams multiplexed onto one
    /// WebSocket connection before a new connection is opened.
    pub max_stream_capacity: usize,
}

impl DepthCacheConfig {
    pub fn new(exchange: ExchangeFlavor) -> Self {
        Self {
            exchange,
            ..Default::default()
        }
    }

    pub fn rest_base_url(&self) -> &str {
        self.base_rest_url
            .as_deref()
            .unwrap_or_else(|| self.exchange.default_rest_base_url())
    }

    pub fn ws_base_url(&self) -> &str {
        self.base_ws_url
            .as_deref()
            .unwrap_or_else(|| self.exchange.default_ws_base_url())
    }
}

impl Default for DepthCacheConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeFlavor::Spot,
            base_rest_url: None,
            base_ws_url: None,
            default_refresh_interval: None,
            depth_cache_update_interval_ms: None,
            high_performance: false,
            init_interval: Duration::from_millis(500),
            init_time_window: Duration::from_secs(5),
            websocket_close_timeout: Duration::from_secs(60),
            websocket_ping_interval: Duration::from_secs(20),
            websocket_ping_timeout: Duration::from_secs(10),
            used_weight_ceiling: 2200,
            max_stream_capacity: 200,
        }
    }
}
