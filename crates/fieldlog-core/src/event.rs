// ABOUTME: Defines the typed events the engine publishes to UI collaborators.
// ABOUTME: Consumers pattern-match on EngineEvent instead of switching on event-name strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, Recording, SyncStatus};

/// Everything the engine announces. Payloads are snapshots; mutating them has
/// no effect on engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Initialization finished and persisted state has been loaded.
    Ready,
    /// Periodic snapshot of every active recording.
    Tick { active: Vec<Recording> },
    Change(ChangeEvent),
    #[serde(rename_all = "camelCase")]
    JobSynced {
        job_id: String,
        server_job_id: Option<String>,
        status: SyncStatus,
    },
    /// The server returned supplementary updates alongside a synced job.
    #[serde(rename_all = "camelCase")]
    Sync {
        job_id: String,
        field_id: String,
        updates: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeEvent {
    Start { recording: Recording },
    Pause { recording: Recording },
    Resume { recording: Recording },
    Stop { job: Box<Job> },
    Loaded { active: Vec<Recording> },
    Reset,
    #[serde(rename_all = "camelCase")]
    JobUpdated {
        job_id: String,
        sync_status: SyncStatus,
    },
}

impl EngineEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Ready => "ready",
            EngineEvent::Tick { .. } => "tick",
            EngineEvent::Change(_) => "change",
            EngineEvent::JobSynced { .. } => "jobSynced",
            EngineEvent::Sync { .. } => "sync",
        }
    }
}
