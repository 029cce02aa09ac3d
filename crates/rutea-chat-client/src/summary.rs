use std::time::Duration;

use async_trait::async_trait;
use rutea_chat_core::SummaryPayload;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::EndpointConfig,
    error::{StoreError, http_error_body},
    store::SummarySink,
};

pub const DEFAULT_SUMMARY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Serialize)]
struct SummaryUpsertRequest<'a> {
    #[serde(rename = "userId")]
    owner_id: &'a str,
    resumen: &'a SummaryPayload,
}

/// Forwards summaries to the summary endpoint, which upserts one row per
/// owner.
#[derive(Debug, Clone)]
pub struct HttpSummaryClient {
    url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpSummaryClient {
    pub fn new(endpoints: &EndpointConfig) -> Self {
        Self::with_client(endpoints.summary_url(), reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_millis(DEFAULT_SUMMARY_TIMEOUT_MS),
            http,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SummarySink for HttpSummaryClient {
    async fn persist_summary(
        &self,
        owner_id: &str,
        summary: &SummaryPayload,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .post(self.url.as_str())
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout)
            .json(&SummaryUpsertRequest {
                owner_id,
                resumen: summary,
            })
            .send()
            .await
            .map_err(|error| StoreError::Request(error.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| StoreError::Request(error.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status,
                body: http_error_body(&bytes),
            });
        }

        info!(owner_id, fields = summary.fields().len(), "summary persisted");
        Ok(())
    }
}
