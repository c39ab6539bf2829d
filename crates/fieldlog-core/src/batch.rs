// ABOUTME: Defines BatchState, the persisted state of a multi-field operation sharing one job configuration.
// ABOUTME: Also defines the per-field start payload and the read-only BatchStatus snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::{BatchRef, JobData, JobType, Reference};

/// Everything needed to start one field's recording, either directly or as
/// part of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPayload {
    pub field_id: String,
    #[serde(rename = "type", alias = "jobType")]
    pub job_type: JobType,
    #[serde(flatten)]
    pub job: JobData,
}

impl FieldPayload {
    pub fn new(field_id: impl Into<String>, job_type: JobType, job: JobData) -> Self {
        Self {
            field_id: field_id.into(),
            job_type,
            job,
        }
    }
}

/// A field still waiting its turn in the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingField {
    pub field_id: String,
    pub field_name: String,
    pub field_area: f64,
    pub field_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultivation: Option<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub total_area: f64,
    pub field_ids: Vec<String>,
    /// Per-type payload and notes shared by every field in the batch.
    pub shared_config: Map<String, Value>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Reference>,
    pub accumulated_time: u64,
    pub batch_start_time: DateTime<Utc>,
    pub current_field_id: String,
    #[serde(default)]
    pub completed_count: usize,
    /// The current field has been stopped and counted, and the next field
    /// has not started yet.
    #[serde(default)]
    pub current_finished: bool,
    pub pending: Vec<PendingField>,
}

impl BatchState {
    /// Build a batch from a non-empty payload list. The first payload
    /// supplies the shared type and equipment; the rest become `pending`.
    /// Returns `None` for an empty list.
    pub fn from_payloads(payloads: &[FieldPayload], started_at: DateTime<Utc>) -> Option<Self> {
        let first = payloads.first()?;
        let pending = payloads
            .iter()
            .enumerate()
            .skip(1)
            .map(|(index, p)| PendingField {
                field_id: p.field_id.clone(),
                field_name: p.job.field_name.clone(),
                field_area: p.job.field_area,
                field_index: index,
                cultivation: p.job.cultivation.clone(),
            })
            .collect();

        Some(Self {
            id: ulid::Ulid::new().to_string(),
            job_type: first.job_type,
            total_area: payloads.iter().map(|p| p.job.field_area).sum(),
            field_ids: payloads.iter().map(|p| p.field_id.clone()).collect(),
            shared_config: first.job.data.clone(),
            notes: first.job.notes.clone(),
            template: first.job.template.clone(),
            machine: first.job.machine.clone(),
            attachment: first.job.attachment.clone(),
            tool: first.job.tool.clone(),
            accumulated_time: 0,
            batch_start_time: started_at,
            current_field_id: first.field_id.clone(),
            completed_count: 0,
            current_finished: false,
            pending,
        })
    }

    pub fn total_fields(&self) -> usize {
        self.field_ids.len()
    }

    pub fn is_pending(&self, field_id: &str) -> bool {
        self.pending.iter().any(|p| p.field_id == field_id)
    }

    pub fn contains(&self, field_id: &str) -> bool {
        self.field_ids.iter().any(|f| f == field_id)
    }

    /// Batch position for the field at `field_index`.
    pub fn batch_ref(&self, field_index: usize) -> BatchRef {
        BatchRef {
            id: self.id.clone(),
            field_index,
            total_fields: self.total_fields(),
            total_area: self.total_area,
        }
    }

    /// Count the current field's recording as done. Repeated calls before the
    /// next field starts change nothing.
    pub fn finish_current(&mut self, elapsed_ms: u64) {
        if self.current_finished {
            return;
        }
        self.accumulated_time += elapsed_ms;
        self.completed_count += 1;
        self.current_finished = true;
    }

    /// Remove `field_id` from `pending` and rebuild its start payload from the
    /// shared configuration. Returns `None` if the field is not pending.
    pub fn take_pending(&mut self, field_id: &str) -> Option<FieldPayload> {
        let pos = self.pending.iter().position(|p| p.field_id == field_id)?;
        let field = self.pending.remove(pos);
        let job = JobData {
            field_name: field.field_name,
            field_area: field.field_area,
            template: self.template.clone(),
            machine: self.machine.clone(),
            attachment: self.attachment.clone(),
            tool: self.tool.clone(),
            cultivation: field.cultivation,
            batch: Some(self.batch_ref(field.field_index)),
            data: self.shared_config.clone(),
            notes: self.notes.clone(),
        };
        self.current_field_id = field.field_id.clone();
        self.current_finished = false;
        Some(FieldPayload::new(field.field_id, self.job_type, job))
    }
}

/// Read-only view of the active batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub batch_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub total_area: f64,
    pub total_fields: usize,
    pub completed_count: usize,
    pub current_field_id: String,
    pub pending_field_ids: Vec<String>,
    pub accumulated_time: u64,
    pub total_elapsed_time: u64,
    pub batch_start_time: DateTime<Utc>,
}

impl BatchStatus {
    /// Combine batch state with the current field's elapsed time.
    pub fn compute(state: &BatchState, current_elapsed: u64) -> Self {
        Self {
            batch_id: state.id.clone(),
            job_type: state.job_type,
            total_area: state.total_area,
            total_fields: state.total_fields(),
            completed_count: state.completed_count,
            current_field_id: state.current_field_id.clone(),
            pending_field_ids: state.pending.iter().map(|p| p.field_id.clone()).collect(),
            accumulated_time: state.accumulated_time,
            total_elapsed_time: state.accumulated_time + current_elapsed,
            batch_start_time: state.batch_start_time,
        }
    }
}
