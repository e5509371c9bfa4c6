use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use stepwire_types::RunId;

use super::{SerializedRecord, Transport, TransportError};

/// HTTP request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct BatchRequest<'a> {
    records: &'a [SerializedRecord],
}

/// Posts batches to `{endpoint}/runs/{run_id}/records`.
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http_client, endpoint))
    }

    pub fn with_client(http_client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn records_url(&self, run_id: &RunId) -> String {
        format!("{}/runs/{}/records", self.endpoint, run_id)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(
        &self,
        run_id: &RunId,
        batch: Vec<SerializedRecord>,
    ) -> Result<(), TransportError> {
        let url = self.records_url(run_id);
        log::debug!("[TRANSPORT] POST {} ({} records)", url, batch.len());

        let resp = self
            .http_client
            .post(&url)
            .json(&BatchRequest { records: &batch })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
