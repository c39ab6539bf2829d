// ABOUTME: The transport seam between the engine and the job API.
// ABOUTME: Implementations resolve with a status and JSON body, or fail with a TransportError.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failures that happen before an HTTP status is available.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Status and decoded body of a completed HTTP exchange. Bodies that are not
/// JSON are carried as `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }
}

/// The job API as the engine sees it.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// `POST /job/record` with an `Idempotency-Key` header.
    async fn post_job(
        &self,
        idempotency_key: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError>;

    /// `GET /job/recent-sprays?fieldIds=...`.
    async fn fetch_recent(&self, field_ids: &[String]) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(TransportResponse::new(201, Value::Null).is_success());
        assert!(!TransportResponse::new(409, Value::Null).is_success());
        assert!(TransportResponse::new(409, Value::Null).is_conflict());
        assert!(!TransportResponse::new(500, Value::Null).is_success());
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "request timed out");
        assert_eq!(
            TransportError::Unavailable("offline".into()).to_string(),
            "transport unavailable: offline"
        );
    }
}
