// ABOUTME: Wire format for the job API: outbound job bodies, upload response classification,
// ABOUTME: and conversion of server jobs into locally cached Jobs during hydration.

use chrono::{DateTime, Utc};
use fieldlog_core::clock::ms_to_datetime;
use fieldlog_core::{
    Job, JobType, Recording, RecordingStatus, Reference, TimestampAction, TimestampEntry,
};
use serde_json::{Map, Value};

use crate::transport::TransportResponse;

pub const RECORD_PATH: &str = "/job/record";
pub const RECENT_PATH: &str = "/job/recent-sprays";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Keys stripped from a job before it goes over the wire.
const TRANSIENT_KEYS: &[&str] = &["idempotencyKey", "lastTick"];

/// Build the upload body for a job: the recording without its transient
/// fields or cache metadata, with `jobType` folded into `type`.
pub fn job_body(job: &Job) -> Result<Value, serde_json::Error> {
    let mut body = serde_json::to_value(&job.record)?;
    if let Value::Object(map) = &mut body {
        for key in TRANSIENT_KEYS {
            map.remove(*key);
        }
        if let Some(job_type) = map.remove("jobType")
            && !map.contains_key("type")
        {
            map.insert("type".to_string(), job_type);
        }
    }
    Ok(body)
}

/// What a single upload attempt amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced {
        server_job_id: Option<String>,
        updates: Option<Value>,
    },
    /// 409: the server already has this idempotency key.
    AlreadySynced,
    Failed { status: u16, message: String },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::Failed { .. })
    }
}

pub fn classify_response(response: &TransportResponse) -> SyncOutcome {
    if response.is_success() {
        let updates = response
            .body
            .get("UPDATES")
            .filter(|u| !u.is_null())
            .cloned();
        return SyncOutcome::Synced {
            server_job_id: server_id(&response.body),
            updates,
        };
    }
    if response.is_conflict() {
        return SyncOutcome::AlreadySynced;
    }
    let message = response
        .body
        .get("message")
        .or_else(|| response.body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", response.status));
    SyncOutcome::Failed {
        status: response.status,
        message,
    }
}

/// The server-assigned id from an upload response: `job._id`, `job.id`,
/// then top-level `_id`, `id`.
pub fn server_id(body: &Value) -> Option<String> {
    let nested = body.get("job").and_then(own_id);
    nested.or_else(|| own_id(body))
}

fn own_id(value: &Value) -> Option<String> {
    ["_id", "id"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(id_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The list of jobs in a recent-jobs response. Accepts a bare array or
/// `{ "jobs": [...] }`; anything else is empty.
pub fn recent_jobs(body: &Value) -> &[Value] {
    match body {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("jobs")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

/// Convert a server job into a synced, cached Job. Returns `None` when the
/// job has no usable id or field id.
pub fn job_from_server(value: &Value, now_ms: u64, ttl_ms: u64) -> Option<Job> {
    let id = own_id(value)?;
    let field = value.get("field");
    let field_id = str_at(value, "fieldId")
        .map(str::to_string)
        .or_else(|| field.and_then(id_string))
        .or_else(|| field.and_then(own_id))?;
    let field_name = str_at(value, "fieldName")
        .or_else(|| field.and_then(|f| str_at(f, "name")))
        .unwrap_or_default()
        .to_string();
    let field_area = value
        .get("fieldArea")
        .and_then(Value::as_f64)
        .unwrap_or_default();
    let job_type = str_at(value, "type")
        .or_else(|| str_at(value, "jobType"))
        .map(JobType::from)
        .unwrap_or(JobType::Custom);

    let now = ms_to_datetime(now_ms);
    let started_at = time_at(value, &["startedAt", "startTime", "createdAt"]).unwrap_or(now);
    let ended_at = time_at(value, &["endedAt", "endTime", "completedAt"]).unwrap_or(started_at);
    let elapsed_time = value
        .get("elapsedTime")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| {
            u64::try_from((ended_at - started_at).num_milliseconds()).unwrap_or_default()
        });
    let last_tick = u64::try_from(ended_at.timestamp_millis()).unwrap_or_default();

    let record = Recording {
        id: id.clone(),
        field_id,
        field_name,
        field_area,
        job_type,
        template: reference_at(value, "template"),
        machine: reference_at(value, "machine"),
        attachment: reference_at(value, "attachment"),
        tool: reference_at(value, "tool"),
        cultivation: reference_at(value, "cultivation"),
        batch: value
            .get("batch")
            .and_then(|b| serde_json::from_value(b.clone()).ok()),
        started_at,
        ended_at: Some(ended_at),
        elapsed_time,
        status: RecordingStatus::Completed,
        last_tick,
        idempotency_key: str_at(value, "idempotencyKey")
            .map(str::to_string)
            .unwrap_or_else(|| format!("server-{id}")),
        timestamps: vec![
            TimestampEntry {
                action: TimestampAction::Start,
                time: started_at,
            },
            TimestampEntry {
                action: TimestampAction::Stop,
                time: ended_at,
            },
        ],
        data: value
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new),
        notes: str_at(value, "notes").unwrap_or_default().to_string(),
    };

    let mut job = Job::from_recording(record, now_ms, ttl_ms);
    job.mark_synced(Some(id), now_ms);
    Some(job)
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Accepts RFC 3339 strings or epoch milliseconds.
fn time_at(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().filter_map(|k| value.get(*k)).find_map(|v| match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_u64().map(ms_to_datetime),
        _ => None,
    })
}

/// References arrive either as objects or as bare id strings.
fn reference_at(value: &Value, key: &str) -> Option<Reference> {
    match value.get(key)? {
        Value::String(id) if !id.is_empty() => Some(Reference::new(id.clone())),
        Value::Object(map) => {
            let mut map = map.clone();
            if !map.contains_key("id")
                && let Some(id) = map.get("_id").cloned()
            {
                map.insert("id".to_string(), id);
            }
            serde_json::from_value(Value::Object(map)).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlog_core::{JobData, SyncStatus};
    use serde_json::json;

    const NOW: u64 = 1_704_067_200_000;
    const DAY: u64 = 86_400_000;

    fn completed_job() -> Job {
        let mut rec = Recording::start("f1", JobType::Spray, JobData::for_field("North", 4.0), NOW);
        rec.complete(NOW + 60_000);
        Job::from_recording(rec, NOW + 60_000, DAY)
    }

    #[test]
    fn body_strips_transient_and_cache_fields() {
        let job = completed_job();
        let body = job_body(&job).unwrap();

        assert!(body.get("idempotencyKey").is_none());
        assert!(body.get("lastTick").is_none());
        assert!(body.get("syncStatus").is_none());
        assert!(body.get("cachedAt").is_none());
        assert_eq!(body["type"], "spray");
        assert_eq!(body["fieldId"], "f1");
        assert_eq!(body["elapsedTime"], 60_000);
        assert_eq!(body["status"], "completed");
    }

    #[test]
    fn success_extracts_nested_server_id_and_updates() {
        let response = TransportResponse::new(
            201,
            json!({"job": {"_id": "srv-1"}, "UPDATES": {"stock": 3}}),
        );
        assert_eq!(
            classify_response(&response),
            SyncOutcome::Synced {
                server_job_id: Some("srv-1".to_string()),
                updates: Some(json!({"stock": 3})),
            }
        );
    }

    #[test]
    fn server_id_fallbacks() {
        assert_eq!(server_id(&json!({"job": {"id": "a"}})).as_deref(), Some("a"));
        assert_eq!(server_id(&json!({"_id": "b"})).as_deref(), Some("b"));
        assert_eq!(server_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(server_id(&json!({"ok": true})), None);
        assert_eq!(server_id(&Value::Null), None);
    }

    #[test]
    fn conflict_and_failure_classification() {
        assert_eq!(
            classify_response(&TransportResponse::new(409, Value::Null)),
            SyncOutcome::AlreadySynced
        );
        assert_eq!(
            classify_response(&TransportResponse::new(500, json!({"message": "boom"}))),
            SyncOutcome::Failed {
                status: 500,
                message: "boom".to_string()
            }
        );
        let failed = classify_response(&TransportResponse::new(502, Value::Null));
        assert_eq!(
            failed,
            SyncOutcome::Failed {
                status: 502,
                message: "HTTP 502".to_string()
            }
        );
        assert!(!failed.is_success());
    }

    #[test]
    fn recent_jobs_accepts_array_or_wrapper() {
        assert_eq!(recent_jobs(&json!([{"_id": "a"}])).len(), 1);
        assert_eq!(recent_jobs(&json!({"jobs": [{"_id": "a"}, {"_id": "b"}]})).len(), 2);
        assert!(recent_jobs(&json!({"error": "nope"})).is_empty());
    }

    #[test]
    fn server_job_becomes_synced_cached_job() {
        let value = json!({
            "_id": "srv-9",
            "field": {"_id": "f7", "name": "East"},
            "fieldArea": 2.5,
            "jobType": "harvest",
            "startedAt": "2024-01-01T08:00:00Z",
            "endedAt": "2024-01-01T09:00:00Z",
            "machine": "m-1",
            "tool": {"_id": "t-1", "name": "Header", "width": 9},
            "notes": "wet corner"
        });

        let job = job_from_server(&value, NOW, DAY).unwrap();
        assert_eq!(job.id(), "srv-9");
        assert_eq!(job.field_id(), "f7");
        assert_eq!(job.record.field_name, "East");
        assert_eq!(job.job_type(), JobType::Harvest);
        assert_eq!(job.record.elapsed_time, 3_600_000);
        assert_eq!(job.cache.sync_status, SyncStatus::Synced);
        assert_eq!(job.cache.server_job_id.as_deref(), Some("srv-9"));
        assert_eq!(job.record.machine.as_ref().unwrap().id, "m-1");
        let tool = job.record.tool.as_ref().unwrap();
        assert_eq!(tool.id, "t-1");
        assert_eq!(tool.extra.get("width"), Some(&json!(9)));
    }

    #[test]
    fn unknown_type_and_missing_ids() {
        let job = job_from_server(&json!({"id": "s", "fieldId": "f", "type": "mulch"}), NOW, DAY)
            .unwrap();
        assert_eq!(job.job_type(), JobType::Custom);
        assert_eq!(job.completed_at(), ms_to_datetime(NOW));

        assert!(job_from_server(&json!({"fieldId": "f"}), NOW, DAY).is_none());
        assert!(job_from_server(&json!({"_id": "s"}), NOW, DAY).is_none());
    }
}
