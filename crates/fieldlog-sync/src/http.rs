// ABOUTME: reqwest-backed SyncTransport talking to the job API.
// ABOUTME: Timeouts are set on the client and surface as TransportError::Timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;

use crate::transport::{SyncTransport, TransportError, TransportResponse};
use crate::wire::{IDEMPOTENCY_HEADER, RECENT_PATH, RECORD_PATH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the job API rooted at `base_url`.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use a preconfigured client, e.g. one carrying session cookies.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn post_job(
        &self,
        idempotency_key: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(self.url(RECORD_PATH))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(classify_error)?;
        read_response(response).await
    }

    async fn fetch_recent(&self, field_ids: &[String]) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .get(self.url(RECENT_PATH))
            .query(&[("fieldIds", field_ids.join(","))])
            .send()
            .await
            .map_err(classify_error)?;
        read_response(response).await
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err)
    }
}

async fn read_response(response: Response) -> Result<TransportResponse, TransportError> {
    let status = response.status().as_u16();
    let text = response.text().await.map_err(classify_error)?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::debug!(status, error = %e, "response body is not JSON");
            Value::Null
        })
    };
    Ok(TransportResponse { status, body })
}
