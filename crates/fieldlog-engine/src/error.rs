// ABOUTME: Error type returned by engine operations.
// ABOUTME: Usage errors leave state untouched; store and transport errors are wrapped via #[from].

use fieldlog_store::StoreError;
use fieldlog_sync::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("field {field_id} already has an active recording")]
    AlreadyActive { field_id: String },

    #[error("maximum of {max} concurrent recordings reached")]
    CapacityExceeded { max: usize },

    #[error("batch needs at least one field")]
    EmptyBatch,

    #[error("a batch is already active")]
    BatchAlreadyActive,

    #[error("no active batch")]
    NoActiveBatch,

    #[error("field {field_id} is not pending in the active batch")]
    FieldNotPending { field_id: String },

    #[error("no active recording for field {field_id}")]
    NoActiveRecording { field_id: String },

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("hydration failed with HTTP {status}")]
    Hydration { status: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// True for errors caused by the caller rather than by storage or the network.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyActive { .. }
                | EngineError::CapacityExceeded { .. }
                | EngineError::EmptyBatch
                | EngineError::BatchAlreadyActive
                | EngineError::NoActiveBatch
                | EngineError::FieldNotPending { .. }
                | EngineError::NoActiveRecording { .. }
                | EngineError::NotInitialized
        )
    }
}
