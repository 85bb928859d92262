//! Venue REST info client
//!
//! Used only for (a) bootstrap book snapshots before a subscription confirms
//! and (b) venue metadata consumed by spot coin resolution and the auto
//! asset selector. Streaming data never flows through here.

use std::time::Duration;

use serde_json::Value;

use crate::adapters::errors::{ExchangeError, ExchangeResult};

use super::config::VenueEndpoints;

/// HTTP request timeout (seconds)
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Thin client for the venue's POST info endpoint
#[derive(Debug, Clone)]
pub struct InfoClient {
    http: reqwest::Client,
    info_url: String,
}

impl InfoClient {
    pub fn new(endpoints: &VenueEndpoints) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .tcp_nodelay(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            info_url: endpoints.info_url(),
        }
    }

    async fn post_info(&self, body: Value) -> ExchangeResult<Value> {
        let response = self
            .http
            .post(&self.info_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExchangeError::ConnectionFailed(format!("info request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(ExchangeError::InvalidResponse(format!(
                "info endpoint returned {}: {}",
                status, text
            )));
        }

        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(format!("invalid JSON: {} - {}", e, text)))
    }

    /// One-shot l2Book snapshot for a coin (bootstrap before the stream confirms)
    pub async fn fetch_book_snapshot(&self, coin: &str) -> ExchangeResult<Value> {
        self.post_info(serde_json::json!({"type": "l2Book", "coin": coin}))
            .await
    }

    /// Spot metadata (universe + token index table)
    pub async fn fetch_spot_meta(&self) -> ExchangeResult<Value> {
        self.post_info(serde_json::json!({"type": "spotMeta"})).await
    }

    /// Spot metadata together with per-asset context rows (selector input)
    pub async fn fetch_spot_meta_and_asset_ctxs(&self) -> ExchangeResult<Value> {
        self.post_info(serde_json::json!({"type": "spotMetaAndAssetCtxs"}))
            .await
    }

    /// Perp universe metadata (selector input)
    pub async fn fetch_perp_meta(&self) -> ExchangeResult<Value> {
        self.post_info(serde_json::json!({"type": "meta"})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(base: &str) -> VenueEndpoints {
        VenueEndpoints {
            websocket_url: "wss://unused".to_string(),
            rest_base: base.to_string(),
            info_path: "/info".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_book_snapshot_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"type": "l2Book", "coin": "BTC"}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"coin":"BTC","levels":[[["100.0","1"]],[["101.0","2"]]],"time":1700000000000}"#)
            .create_async()
            .await;

        let client = InfoClient::new(&endpoints(&server.url()));
        let snapshot = client.fetch_book_snapshot("BTC").await.unwrap();
        assert_eq!(snapshot["coin"], "BTC");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_spot_meta_http_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let client = InfoClient::new(&endpoints(&server.url()));
        let result = client.fetch_spot_meta().await;
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("500"), "Got: {}", msg);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_perp_meta_invalid_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/info")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = InfoClient::new(&endpoints(&server.url()));
        let result = client.fetch_perp_meta().await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid JSON"));
    }
}
