// ABOUTME: Defines Recording (an in-progress timed unit of field work) and Job (a finalized recording).
// ABOUTME: Elapsed-time accounting and the start/pause/resume/complete transitions live here.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::ms_to_datetime;

/// The kind of field work being recorded. Unknown strings deserialize as `Custom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Sow,
    Harvest,
    Spray,
    Irrigate,
    #[serde(other)]
    Custom,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Sow => "sow",
            JobType::Harvest => "harvest",
            JobType::Spray => "spray",
            JobType::Irrigate => "irrigate",
            JobType::Custom => "custom",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "sow" | "sowing" => JobType::Sow,
            "harvest" | "harvesting" => JobType::Harvest,
            "spray" | "spraying" => JobType::Spray,
            "irrigate" | "irrigation" => JobType::Irrigate,
            _ => JobType::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampAction {
    Start,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub action: TimestampAction,
    pub time: DateTime<Utc>,
}

/// A reference to an external entity (template, machine, attachment, tool,
/// cultivation). Keys beyond `id` and `name` are carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            extra: Map::new(),
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            extra: Map::new(),
        }
    }
}

/// Position of a recording inside a multi-field batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRef {
    pub id: String,
    pub field_index: usize,
    pub total_fields: usize,
    pub total_area: f64,
}

/// Caller-supplied data used to start a recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobData {
    pub field_name: String,
    pub field_area: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cultivation: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchRef>,
    pub data: Map<String, Value>,
    pub notes: String,
}

impl JobData {
    pub fn for_field(field_name: impl Into<String>, field_area: f64) -> Self {
        Self {
            field_name: field_name.into(),
            field_area,
            ..Self::default()
        }
    }
}

/// An in-progress (or just finalized) timed unit of field work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: String,
    pub field_id: String,
    pub field_name: String,
    pub field_area: f64,
    #[serde(rename = "type", alias = "jobType")]
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultivation: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchRef>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Milliseconds spent in the `Running` state.
    pub elapsed_time: u64,
    pub status: RecordingStatus,
    /// Epoch milliseconds at which `elapsed_time` was last brought up to date.
    pub last_tick: u64,
    pub idempotency_key: String,
    #[serde(default)]
    pub timestamps: Vec<TimestampEntry>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub notes: String,
}

impl Recording {
    /// Create a running recording for `field_id` at `now_ms`.
    pub fn start(field_id: &str, job_type: JobType, job: JobData, now_ms: u64) -> Self {
        let started_at = ms_to_datetime(now_ms);
        Self {
            id: ulid::Ulid::new().to_string(),
            field_id: field_id.to_string(),
            field_name: job.field_name,
            field_area: job.field_area,
            job_type,
            template: job.template,
            machine: job.machine,
            attachment: job.attachment,
            tool: job.tool,
            cultivation: job.cultivation,
            batch: job.batch,
            started_at,
            ended_at: None,
            elapsed_time: 0,
            status: RecordingStatus::Running,
            last_tick: now_ms,
            idempotency_key: ulid::Ulid::new().to_string(),
            timestamps: vec![TimestampEntry {
                action: TimestampAction::Start,
                time: started_at,
            }],
            data: job.data,
            notes: job.notes,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RecordingStatus::Running
    }

    /// Credit a running recording with the time since its last tick.
    /// Time never runs backwards: a clock earlier than `last_tick` adds nothing.
    pub fn accrue(&mut self, now_ms: u64) {
        if self.status != RecordingStatus::Running {
            return;
        }
        if now_ms > self.last_tick {
            self.elapsed_time += now_ms - self.last_tick;
            self.last_tick = now_ms;
        }
    }

    /// Returns false if the recording was not running.
    pub fn pause(&mut self, now_ms: u64) -> bool {
        if self.status != RecordingStatus::Running {
            return false;
        }
        self.accrue(now_ms);
        self.status = RecordingStatus::Paused;
        self.push_timestamp(TimestampAction::Pause, now_ms);
        true
    }

    /// Returns false if the recording was not paused.
    pub fn resume(&mut self, now_ms: u64) -> bool {
        if self.status != RecordingStatus::Paused {
            return false;
        }
        self.status = RecordingStatus::Running;
        self.last_tick = now_ms;
        self.push_timestamp(TimestampAction::Resume, now_ms);
        true
    }

    /// Finalize the recording: accrue outstanding time, set `ended_at` and
    /// flip the status to `Completed`.
    pub fn complete(&mut self, now_ms: u64) {
        self.accrue(now_ms);
        self.status = RecordingStatus::Completed;
        self.ended_at = Some(ms_to_datetime(now_ms));
        self.push_timestamp(TimestampAction::Stop, now_ms);
    }

    fn push_timestamp(&mut self, action: TimestampAction, now_ms: u64) {
        self.timestamps.push(TimestampEntry {
            action,
            time: ms_to_datetime(now_ms),
        });
    }
}

/// Local cache bookkeeping attached to a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_job_id: Option<String>,
}

/// A completed recording plus its cache metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub record: Recording,
    #[serde(flatten)]
    pub cache: CacheMeta,
}

impl Job {
    /// Wrap a completed recording as a pending job cached at `now_ms`
    /// that expires after `ttl_ms`.
    pub fn from_recording(record: Recording, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            record,
            cache: CacheMeta {
                cached_at: ms_to_datetime(now_ms),
                expires_at: ms_to_datetime(now_ms.saturating_add(ttl_ms)),
                sync_status: SyncStatus::Pending,
                synced_at: None,
                server_job_id: None,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn field_id(&self) -> &str {
        &self.record.field_id
    }

    pub fn job_type(&self) -> JobType {
        self.record.job_type
    }

    /// Completion time used for ordering; falls back to the start time for
    /// records that were never finalized.
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.record.ended_at.unwrap_or(self.record.started_at)
    }

    pub fn is_synced(&self) -> bool {
        self.cache.sync_status == SyncStatus::Synced
    }

    pub fn mark_synced(&mut self, server_job_id: Option<String>, now_ms: u64) {
        self.cache.sync_status = SyncStatus::Synced;
        self.cache.synced_at = Some(ms_to_datetime(now_ms));
        if server_job_id.is_some() {
            self.cache.server_job_id = server_job_id;
        }
    }
}
