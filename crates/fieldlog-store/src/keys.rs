// ABOUTME: Names of every key the engine persists.
// ABOUTME: All keys share the `fieldlog.` namespace so a reset can find them by prefix.

pub const NAMESPACE: &str = "fieldlog.";

pub const ACTIVE_RECORDINGS: &str = "fieldlog.active";
pub const SYNC_QUEUE: &str = "fieldlog.sync_queue";
pub const COMPLETION_STAGING: &str = "fieldlog.completion_staging";
pub const JOB_INDEX: &str = "fieldlog.job_index";
pub const META: &str = "fieldlog.meta";
pub const BATCH: &str = "fieldlog.batch";
pub const RETRY_META: &str = "fieldlog.retry_meta";

/// Prefix shared by all cached job entries.
pub const JOB_PREFIX: &str = "fieldlog.job.";

pub fn job_key(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

/// Inverse of [`job_key`].
pub fn job_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(JOB_PREFIX).filter(|id| !id.is_empty())
}
