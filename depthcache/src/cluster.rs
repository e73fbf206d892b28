//! Thin client for a remote depth-cache *cluster* server (the "UBDCC"
//! protocol): a separate process exposing the same create/read/stop surface
//! as `DepthCacheManager` over plain HTTP GET requests.
//!
//! This is a CLIENT only -- per spec.md §1, the cluster server itself is an
//! external collaborator and out of scope. Grounded on
//! `original_source/unicorn_binance_local_depth_cache/cluster.py`; license
//! submission is dropped (a Non-goal). Request plumbing follows the
//! teacher's `NordHttpClient::get` (`rest/mod.rs`): a `reqwest::Client`
//! wrapper with one generic JSON-GET helper and HTTP-status-to-typed-error
//! mapping.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{TransportError, TransportResult};

/// Client for a remote depth-cache cluster server.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterInfo {
    pub app: ClusterAppInfo,
    pub result: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterAppInfo {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterDepthCacheList {
    pub markets: Vec<String>,
}

impl ClusterClient {
    pub fn new(address: &str, port: Option<u16>) -> Self {
        let base_url = match port {
            Some(80) | None => format!("http://{address}/"),
            Some(port) => format!("http://{address}:{port}/"),
        };
        Self {
            client: Client::new(),
            base_url,
        }
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> TransportResult<T> {
        let url = format!("{}{endpoint}", self.base_url);
        let resp = self.client.get(&url).query(query).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http { status, message });
        }

        resp.json::<T>().await.map_err(TransportError::Request)
    }

    pub async fn create_depthcache(
        &self,
        exchange: &str,
        market: &str,
        refresh_interval: Option<u64>,
    ) -> TransportResult<serde_json::Value> {
        let mut query = vec![
            ("exchange", exchange.to_string()),
            ("market", market.to_string()),
        ];
        if let Some(interval) = refresh_interval {
            query.push(("refresh_interval", interval.to_string()));
        }
        self.get("create_depthcache", &query).await
    }

    pub async fn get_asks(
        &self,
        exchange: &str,
        market: &str,
        limit_count: Option<usize>,
        threshold_volume: Option<f64>,
    ) -> TransportResult<serde_json::Value> {
        self.view_endpoint("get_asks", exchange, market, limit_count, threshold_volume).await
    }

    pub async fn get_bids(
        &self,
        exchange: &str,
        market: &str,
        limit_count: Option<usize>,
        threshold_volume: Option<f64>,
    ) -> TransportResult<serde_json::Value> {
        self.view_endpoint("get_bids", exchange, market, limit_count, threshold_volume).await
    }

    async fn view_endpoint(
        &self,
        endpoint: &str,
        exchange: &str,
        market: &str,
        limit_count: Option<usize>,
        threshold_volume: Option<f64>,
    ) -> TransportResult<serde_json::Value> {
        let mut query = vec![
            ("exchange", exchange.to_string()),
            ("market", market.to_string()),
        ];
        if let Some(limit) = limit_count {
            query.push(("limit_count", limit.to_string()));
        }
        if let Some(threshold) = threshold_volume {
            query.push(("threshold_volume", threshold.to_string()));
        }
        self.get(endpoint, &query).await
    }

    pub async fn stop_depthcache(&self, exchange: &str, market: &str) -> TransportResult<serde_json::Value> {
        let query = vec![
            ("exchange", exchange.to_string()),
            ("market", market.to_string()),
        ];
        self.get("stop_depthcache", &query).await
    }

    pub async fn get_cluster_info(&self) -> TransportResult<ClusterInfo> {
        self.get("get_cluster_info", &[]).await
    }

    pub async fn get_depthcache_list(&self) -> TransportResult<ClusterDepthCacheList> {
        self.get("get_depthcache_list", &[]).await
    }

    /// Probes `get_cluster_info`-equivalent `test` endpoint and checks for
    /// the expected app identity, matching `cluster.py::test`.
    pub async fn test(&self) -> bool {
        match self.get::<ClusterInfo>("test", &[]).await {
            Ok(info) => info.app.name == "lucit-ubdcc-restapi" && info.result == "OK",
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_omits_port_from_url() {
        let client = ClusterClient::new("cluster.example.com", None);
        assert_eq!(client.base_url, "http://cluster.example.com/");
    }

    #[test]
    fn explicit_port_is_included() {
        let client = ClusterClient::new("cluster.example.com", Some(8080));
        assert_eq!(client.base_url, "http://cluster.example.com:8080/");
    }

    #[tokio::test]
    async fn get_cluster_info_against_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/get_cluster_info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "app": {"name": "lucit-ubdcc-restapi", "version": "1.0"},
                "result": "OK",
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        let (address, port) = {
            let without_scheme = uri.trim_start_matches("http://");
            let mut parts = without_scheme.splitn(2, ':');
            let host = parts.next().unwrap().to_string();
            let port: u16 = parts.next().unwrap().parse().unwrap();
            (host, port)
        };
        let client = ClusterClient::new(&address, Some(port));
        let info = client.get_cluster_info().await.unwrap();
        assert_eq!(info.app.name, "lucit-ubdcc-restapi");
    }
}
