//! REST-backed persistence sink
//!
//! POSTs rows to a configurable endpoint. Disabled mode short-circuits every
//! write so the engine runs unchanged without an external store. Errors are
//! mapped to `SinkError` and never crash the ingestion path.

use async_trait::async_trait;

use crate::config::PersistenceSettings;

use super::{
    DecisionOutcomeRow, DecisionSnapshotRow, MakerProbeRow, OpportunityRow, PersistenceSink,
    SinkError, SinkResult,
};

/// Sink that writes rows to a REST endpoint
pub struct RestSink {
    base_url: String,
    client: Option<reqwest::Client>,
}

impl RestSink {
    pub fn new(settings: &PersistenceSettings) -> Self {
        let client = if settings.enabled {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/json"),
            );
            if !settings.api_key.is_empty() {
                if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!(
                    "Bearer {}",
                    settings.api_key
                )) {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(
                reqwest::Client::builder()
                    .default_headers(headers)
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            )
        } else {
            None
        };

        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// A sink that drops every row (persistence disabled)
    pub fn disabled() -> Self {
        Self::new(&PersistenceSettings::default())
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, path: &str, body: &T) -> SinkResult<()> {
        let Some(client) = self.client.as_ref() else {
            tracing::debug!(path = path, "persistence disabled, row not written");
            return Ok(());
        };

        let url = format!("{}/{}", self.base_url, path);
        let response = client
            .post(&url)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED => {
                Err(SinkError::Rejected("invalid sink credentials".to_string()))
            }
            status => {
                let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
                Err(SinkError::Unavailable(format!("sink error {}: {}", status, body)))
            }
        }
    }
}

#[async_trait]
impl PersistenceSink for RestSink {
    async fn insert_opportunity(&self, row: OpportunityRow) -> SinkResult<()> {
        self.post("opportunities", &row).await?;
        tracing::info!(
            asset = %row.asset,
            direction = %row.direction,
            edge_bps = row.edge_bps,
            pnl_net_estimated = row.pnl_net_estimated,
            "opportunity persisted"
        );
        Ok(())
    }

    async fn insert_validation_batch(
        &self,
        snapshots: &[DecisionSnapshotRow],
        outcomes: &[DecisionOutcomeRow],
    ) -> SinkResult<()> {
        let body = serde_json::json!({
            "snapshots": snapshots,
            "outcomes": outcomes,
        });
        self.post("validation", &body).await
    }

    async fn upsert_maker_probe(&self, row: MakerProbeRow) -> SinkResult<()> {
        self.post("maker_probes", &row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn settings(url: &str, enabled: bool) -> PersistenceSettings {
        PersistenceSettings {
            enabled,
            base_url: url.to_string(),
            api_key: "test-key".to_string(),
        }
    }

    fn opportunity() -> OpportunityRow {
        OpportunityRow {
            run_id: "run-1".to_string(),
            timestamp: Utc::now(),
            asset: "BTC".to_string(),
            direction: "spot_long".to_string(),
            spot_price: 50010.0,
            perp_price: 50100.0,
            mark_price: 50050.0,
            notional: 100.0,
            spread_gross: 0.0018,
            edge_bps: 18.0,
            fee_estimated: 0.15,
            slippage_estimated: 0.0,
            funding_estimated: 0.0,
            pnl_net_estimated: 0.03,
        }
    }

    #[tokio::test]
    async fn test_disabled_sink_skips_http() {
        let sink = RestSink::disabled();
        assert!(sink.insert_opportunity(opportunity()).await.is_ok());
        assert!(sink.insert_validation_batch(&[], &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_insert_opportunity_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/opportunities")
            .with_status(201)
            .create_async()
            .await;

        let sink = RestSink::new(&settings(&server.url(), true));
        assert!(sink.insert_opportunity(opportunity()).await.is_ok());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_rejected() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/opportunities")
            .with_status(401)
            .with_body("Unauthorized")
            .create_async()
            .await;

        let sink = RestSink::new(&settings(&server.url(), true));
        let result = sink.insert_opportunity(opportunity()).await;
        match result {
            Err(SinkError::Rejected(msg)) => assert!(msg.contains("credentials")),
            other => panic!("Expected Rejected, got {:?}", other.map(|_| ())),
        }

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_maps_to_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/validation")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let sink = RestSink::new(&settings(&server.url(), true));
        let result = sink.insert_validation_batch(&[], &[]).await;
        match result {
            Err(SinkError::Unavailable(msg)) => {
                assert!(msg.contains("503"), "Got: {}", msg);
            }
            other => panic!("Expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }
}
