// ABOUTME: Local cache of completed jobs (one store key per job) and the secondary index over it.
// ABOUTME: Queries resolve ids through the index, load in bounded batches, then filter, sort and limit.

use chrono::{DateTime, Utc};
use fieldlog_core::clock::ms_to_datetime;
use fieldlog_core::{ChangeEvent, EngineEvent, Job, JobIndex, JobType, SyncStatus};
use fieldlog_store::{keys, read_json, write_json};

use crate::engine::{Engine, EngineState};
use crate::error::EngineError;

pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Filters for cache queries. Results are always newest-completed first.
#[derive(Debug, Clone, PartialEq)]
pub struct JobQuery {
    pub job_type: Option<JobType>,
    pub limit: usize,
    /// Keep jobs completed at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring over field name, job type and notes.
    pub search: Option<String>,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            job_type: None,
            limit: DEFAULT_QUERY_LIMIT,
            since: None,
            search: None,
        }
    }
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if self.job_type.is_some_and(|t| t != job.job_type()) {
            return false;
        }
        if self.since.is_some_and(|since| job.completed_at() < since) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                job.record.field_name.to_lowercase().contains(&needle)
                    || job.job_type().as_str().contains(&needle)
                    || job.record.notes.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }

    fn apply(&self, jobs: Vec<Job>) -> Vec<Job> {
        let mut jobs: Vec<Job> = jobs.into_iter().filter(|j| self.matches(j)).collect();
        jobs.sort_by(|a, b| b.completed_at().cmp(&a.completed_at()));
        jobs.truncate(self.limit);
        jobs
    }
}

impl Engine {
    /// Store a completed job and index it, evicting the field's oldest synced
    /// job if the per-field cap is exceeded.
    pub async fn cache_job(&self, job: Job) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        self.cache_job_locked(&mut state, &job).await
    }

    pub(crate) async fn cache_job_locked(
        &self,
        state: &mut EngineState,
        job: &Job,
    ) -> Result<(), EngineError> {
        write_json(self.store(), &keys::job_key(job.id()), job).await?;
        state.index.insert(job.id(), job.field_id(), job.job_type());
        self.persist_index(state).await?;
        self.evict_overflow(state, job.field_id()).await
    }

    async fn evict_overflow(&self, state: &mut EngineState, field_id: &str) -> Result<(), EngineError> {
        let cap = self.inner.config.cache_per_field;
        let ids = state.index.for_field(field_id);
        if ids.len() <= cap {
            return Ok(());
        }
        let jobs = self.load_jobs(ids).await?;
        let Some(oldest) = jobs.iter().min_by_key(|j| j.completed_at()) else {
            return Ok(());
        };
        if !oldest.is_synced() {
            tracing::debug!(field_id, job_id = %oldest.id(), "oldest cached job not synced, keeping");
            return Ok(());
        }
        tracing::debug!(field_id, job_id = %oldest.id(), "evicting oldest cached job");
        let id = oldest.id().to_string();
        self.remove_cached_locked(state, &id).await?;
        Ok(())
    }

    /// Returns false if the job was not cached.
    pub async fn remove_cached(&self, job_id: &str) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        self.remove_cached_locked(&mut state, job_id).await
    }

    pub(crate) async fn remove_cached_locked(
        &self,
        state: &mut EngineState,
        job_id: &str,
    ) -> Result<bool, EngineError> {
        let key = keys::job_key(job_id);
        let Some(raw) = self.store().get(&key).await? else {
            if state.index.purge(job_id) {
                self.persist_index(state).await?;
            }
            return Ok(false);
        };
        let job = serde_json::from_str::<Job>(&raw).ok();
        self.store().remove(&key).await?;

        let unindexed = match &job {
            Some(job) => state.index.remove(job_id, job.field_id(), job.job_type()),
            None => state.index.purge(job_id),
        };
        if unindexed {
            self.persist_index(state).await?;
        }
        Ok(true)
    }

    pub async fn get_history(&self, field_id: &str, query: &JobQuery) -> Result<Vec<Job>, EngineError> {
        let state = self.inner.state.lock().await;
        let ids = match query.job_type {
            Some(job_type) => state.index.for_field_and_type(field_id, job_type),
            None => state.index.for_field(field_id),
        };
        Ok(query.apply(self.load_jobs(ids).await?))
    }

    pub async fn get_by_type(&self, job_type: JobType, query: &JobQuery) -> Result<Vec<Job>, EngineError> {
        let state = self.inner.state.lock().await;
        let ids = state.index.for_type(job_type);
        let query = query.clone().of_type(job_type);
        Ok(query.apply(self.load_jobs(ids).await?))
    }

    pub async fn get_all_cached_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, EngineError> {
        let state = self.inner.state.lock().await;
        let ids = match query.job_type {
            Some(job_type) => state.index.for_type(job_type),
            None => state.index.all_ids(),
        };
        Ok(query.apply(self.load_jobs(ids).await?))
    }

    /// Mark a cached job as synced outside the drain, e.g. after the server
    /// confirmed it through another channel. The job also leaves the sync
    /// queue. Returns false if the job is not cached.
    pub async fn mark_synced(
        &self,
        job_id: &str,
        server_job_id: Option<String>,
    ) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        let marked = self.mark_synced_locked(&mut state, job_id, server_job_id).await?;
        self.dequeue_locked(&mut state, job_id).await?;
        Ok(marked)
    }

    pub(crate) async fn mark_synced_locked(
        &self,
        _state: &mut EngineState,
        job_id: &str,
        server_job_id: Option<String>,
    ) -> Result<bool, EngineError> {
        let key = keys::job_key(job_id);
        let Some(mut job) = read_json::<Job>(self.store(), &key).await? else {
            return Ok(false);
        };
        job.mark_synced(server_job_id, self.now_ms());
        write_json(self.store(), &key, &job).await?;
        self.emit(EngineEvent::Change(ChangeEvent::JobUpdated {
            job_id: job_id.to_string(),
            sync_status: SyncStatus::Synced,
        }));
        Ok(true)
    }

    pub(crate) async fn is_synced_in_cache(&self, job_id: &str) -> Result<bool, EngineError> {
        let job: Option<Job> = read_json(self.store(), &keys::job_key(job_id)).await?;
        Ok(job.is_some_and(|j| j.is_synced()))
    }

    /// Load jobs by id in batches of `query_batch_size`. Missing and corrupt
    /// entries are skipped.
    pub(crate) async fn load_jobs(
        &self,
        ids: impl IntoIterator<Item = String>,
    ) -> Result<Vec<Job>, EngineError> {
        let keys: Vec<String> = ids.into_iter().map(|id| keys::job_key(&id)).collect();
        let mut jobs = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.inner.config.query_batch_size) {
            for (key, raw) in self.store().multi_get(chunk).await? {
                let Some(raw) = raw else {
                    tracing::debug!(key = %key, "indexed job missing from cache");
                    continue;
                };
                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => jobs.push(job),
                    Err(e) => tracing::warn!(key = %key, error = %e, "skipping corrupt cached job"),
                }
            }
        }
        Ok(jobs)
    }

    /// The persisted index, or one rebuilt from the cached job keys when it
    /// is missing or unreadable.
    pub(crate) async fn load_index(&self) -> Result<JobIndex, EngineError> {
        if let Some(index) = read_json::<JobIndex>(self.store(), keys::JOB_INDEX).await? {
            return Ok(index);
        }
        let job_keys = self.store().keys_with_prefix(keys::JOB_PREFIX).await?;
        if job_keys.is_empty() {
            return Ok(JobIndex::new());
        }
        let ids = job_keys
            .iter()
            .filter_map(|k| keys::job_id_from_key(k))
            .map(str::to_string);
        let jobs = self.load_jobs(ids).await?;
        let index = JobIndex::rebuild(&jobs);
        write_json(self.store(), keys::JOB_INDEX, &index).await?;
        tracing::warn!(jobs = index.len(), "job index missing or corrupt, rebuilt from cache");
        Ok(index)
    }

    pub(crate) async fn persist_index(&self, state: &EngineState) -> Result<(), EngineError> {
        write_json(self.store(), keys::JOB_INDEX, &state.index).await?;
        Ok(())
    }

    /// Remove synced jobs past their expiry. Pending jobs are never swept.
    pub(crate) async fn sweep_expired(&self, state: &mut EngineState) -> Result<usize, EngineError> {
        let now = ms_to_datetime(self.now_ms());
        let jobs = self.load_jobs(state.index.all_ids()).await?;
        let mut swept = 0;
        for job in jobs.iter().filter(|j| j.is_synced() && j.cache.expires_at <= now) {
            self.store().remove(&keys::job_key(job.id())).await?;
            state.index.remove(job.id(), job.field_id(), job.job_type());
            swept += 1;
        }
        if swept > 0 {
            self.persist_index(state).await?;
            tracing::info!(swept, "expired cached jobs removed");
        }
        Ok(swept)
    }
}
