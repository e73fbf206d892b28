//! External REST collaborator: fetches the point-in-time snapshot used to
//! anchor a depth cache, and reports the exchange's current weight usage so
//! the dispatcher can back off before tripping the rate limiter.
//!
//! Grounded on the teacher's `NordHttpClient` (`rest/mod.rs`): same
//! `reqwest::Client` wrapper, same HTTP-status-to-typed-error mapping.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::ExchangeFlavor;
use crate::error::{TransportError, TransportResult};
use crate::types::OrderBookSnapshot;

/// The external REST collaborator abstraction spec.md §1 calls out. A
/// concrete implementation is injected into `DepthCacheManager`; tests
/// supply a fake.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn get_order_book(&self, market: &str) -> TransportResult<OrderBookSnapshot>;

    /// Exchange-reported `X-MBX-USED-WEIGHT-1M`. A missing header is not a
    /// hard error -- it is treated as "fully recovered locally", i.e. 0.
    async fn get_used_weight(&self) -> TransportResult<u32>;
}

/// `reqwest`-backed `SnapshotSource` talking to the real exchange.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    exchange: ExchangeFlavor,
}

impl BinanceRestClient {
    pub fn new(base_url: String, exchange: ExchangeFlavor) -> Self {
        Self {
            client: Client::new(),
            base_url,
            exchange,
        }
    }

    fn depth_path(&self) -> &'static str {
        match self.exchange {
            ExchangeFlavor::Spot => "/api/v3/depth",
            ExchangeFlavor::LinearFutures => "/fapi/v1/depth",
        }
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestClient {
    async fn get_order_book(&self, market: &str) -> TransportResult<OrderBookSnapshot> {
        let url = format!("{}{}", self.base_url, self.depth_path());
        debug!("fetching snapshot for {market} from {url}");

        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", &market.to_uppercase()), ("limit", &"1000".to_string())])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http { status, message });
        }

        resp.json::<OrderBookSnapshot>()
            .await
            .map_err(TransportError::Request)
    }

    async fn get_used_weight(&self) -> TransportResult<u32> {
        let url = format!("{}{}", self.base_url, self.depth_path());
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", "BTCUSDT"), ("limit", "5")])
            .send()
            .await?;

        let weight = resp
            .headers()
            .get("x-mbx-used-weight-1m")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spot_and_futures_use_distinct_depth_paths() {
        let spot = BinanceRestClient::new("https://api.binance.com".to_string(), ExchangeFlavor::Spot);
        let futures = BinanceRestClient::new(
            "https://fapi.binance.com".to_string(),
            ExchangeFlavor::LinearFutures,
        );
        assert_eq!(spot.depth_path(), "/api/v3/depth");
        assert_eq!(futures.depth_path(), "/fapi/v1/depth");
    }

    #[tokio::test]
    async fn snapshot_fetch_against_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/depth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "lastUpdateId": 100,
                "bids": [["9.0", "2.0"]],
                "asks": [["10.0", "1.0"]],
            })))
            .mount(&server)
            .await;

        let client = BinanceRestClient::new(server.uri(), ExchangeFlavor::Spot);
        let snapshot = client.get_order_book("btcusdt").await.unwrap();
        assert_eq!(snapshot.last_update_id, 100);
        assert_eq!(snapshot.bids, vec![("9.0".to_string(), "2.0".to_string())]);
    }

    #[tokio::test]
    async fn used_weight_falls_back_to_zero_when_header_absent() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/depth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "lastUpdateId": 1,
                "bids": [],
                "asks": [],
            })))
            .mount(&server)
            .await;

        let client = BinanceRestClient::new(server.uri(), ExchangeFlavor::Spot);
        assert_eq!(client.get_used_weight().await.unwrap(), 0);
    }
}
