// ABOUTME: Scripted SyncTransport for deterministic tests of the sync pipeline.
// ABOUTME: Replays queued responses in order and records every upload it receives.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::transport::{SyncTransport, TransportError, TransportResponse};

/// One `post_job` call as seen by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub idempotency_key: String,
    pub body: Value,
}

enum Scripted {
    Respond(TransportResponse),
    Fail(String),
}

#[derive(Default)]
struct ScriptState {
    posts: VecDeque<Scripted>,
    recent: VecDeque<Scripted>,
    recorded: Vec<RecordedPost>,
    recent_requests: Vec<Vec<String>>,
    next_server_id: u32,
}

/// A transport that answers from a script. Once the upload script is
/// exhausted every post succeeds with `201 {"job": {"_id": "srv-N"}}`; once
/// the recent script is exhausted hydration returns an empty array.
///
/// Clones share the same script and call log.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next upload.
    pub fn push_status(&self, status: u16, body: Value) -> &Self {
        self.state
            .lock()
            .posts
            .push_back(Scripted::Respond(TransportResponse::new(status, body)));
        self
    }

    /// Queue a network failure for the next upload.
    pub fn push_network_error(&self, message: &str) -> &Self {
        self.state
            .lock()
            .posts
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    /// Queue a response for the next hydration fetch.
    pub fn push_recent(&self, status: u16, body: Value) -> &Self {
        self.state
            .lock()
            .recent
            .push_back(Scripted::Respond(TransportResponse::new(status, body)));
        self
    }

    pub fn push_recent_error(&self, message: &str) -> &Self {
        self.state
            .lock()
            .recent
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.state.lock().recorded.clone()
    }

    pub fn post_count(&self) -> usize {
        self.state.lock().recorded.len()
    }

    /// Field-id lists passed to each hydration fetch.
    pub fn recent_requests(&self) -> Vec<Vec<String>> {
        self.state.lock().recent_requests.clone()
    }
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn post_job(
        &self,
        idempotency_key: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let mut state = self.state.lock();
        state.recorded.push(RecordedPost {
            idempotency_key: idempotency_key.to_string(),
            body: body.clone(),
        });
        match state.posts.pop_front() {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(TransportError::Unavailable(message)),
            None => {
                state.next_server_id += 1;
                let id = format!("srv-{}", state.next_server_id);
                Ok(TransportResponse::new(201, json!({ "job": { "_id": id } })))
            }
        }
    }

    async fn fetch_recent(&self, field_ids: &[String]) -> Result<TransportResponse, TransportError> {
        let mut state = self.state.lock();
        state.recent_requests.push(field_ids.to_vec());
        match state.recent.pop_front() {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(TransportError::Unavailable(message)),
            None => Ok(TransportResponse::new(200, json!([]))),
        }
    }
}
