// ABOUTME: Durable outbox of completed jobs and the drain pass that uploads them with backoff.
// ABOUTME: One pass runs at a time; HTTP calls happen with the state lock released.

use std::sync::atomic::{AtomicBool, Ordering};

use fieldlog_core::{EngineEvent, Job, RetryMeta, SyncStatus};
use fieldlog_store::{keys, write_json};
use fieldlog_sync::{SyncOutcome, classify_response, job_body};
use serde::Serialize;
use serde_json::Value;

use crate::engine::{Engine, EngineState};
use crate::error::EngineError;
use crate::scheduler::every_interval;

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Waiting for their next retry time.
    pub deferred: usize,
    /// Out of attempts; they stay queued.
    pub abandoned: usize,
    /// True when another pass was already running.
    pub skipped: bool,
}

/// A queued job together with its retry state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub job: Job,
    pub retry: Option<RetryMeta>,
    pub abandoned: bool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Engine {
    /// Run one drain pass now. Concurrent calls coalesce into the running
    /// pass and return a report with `skipped` set.
    pub async fn drain(&self) -> DrainReport {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain already running");
            return DrainReport {
                skipped: true,
                ..DrainReport::default()
            };
        }
        let _guard = DrainGuard(&self.inner.draining);

        let mut report = DrainReport::default();
        let due = {
            let state = self.inner.state.lock().await;
            if !state.initialized {
                return report;
            }
            let now = self.now_ms();
            let policy = &self.inner.config.backoff;
            let mut due = Vec::new();
            for job in &state.queue {
                match state.retry.get(job.id()) {
                    Some(meta) if policy.is_exhausted(meta.attempts) => report.abandoned += 1,
                    Some(meta) if !meta.is_due(now) => {
                        tracing::debug!(job_id = %job.id(), next_retry = meta.next_retry, "retry not due");
                        report.deferred += 1;
                    }
                    _ => due.push(job.clone()),
                }
            }
            due
        };

        for job in due {
            report.attempted += 1;
            let result = match self.upload(&job).await {
                Ok(SyncOutcome::Failed { message, .. }) | Err(message) => {
                    report.failed += 1;
                    self.record_failure(&job, message).await
                }
                Ok(outcome) => self.record_success(&job, outcome).await,
            };
            match result {
                Ok(true) => report.synced += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id(), error = %e, "failed to persist sync result");
                }
            }
        }

        if report.attempted > 0 || report.abandoned > 0 {
            tracing::info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                abandoned = report.abandoned,
                "sync drain finished"
            );
        }
        report
    }

    async fn upload(&self, job: &Job) -> Result<SyncOutcome, String> {
        let body = job_body(job).map_err(|e| e.to_string())?;
        self.inner
            .transport
            .post_job(&job.record.idempotency_key, &body)
            .await
            .map(|response| classify_response(&response))
            .map_err(|e| e.to_string())
    }

    /// Returns true once the job is out of the queue and marked synced, and
    /// false when it vanished during the upload (a reset, for instance).
    async fn record_success(&self, job: &Job, outcome: SyncOutcome) -> Result<bool, EngineError> {
        let (server_job_id, updates) = match outcome {
            SyncOutcome::Synced {
                server_job_id,
                updates,
            } => (server_job_id, updates),
            _ => (None, None),
        };

        let mut state = self.inner.state.lock().await;
        let dequeued = self.dequeue_locked(&mut state, job.id()).await?;
        let marked = self
            .mark_synced_locked(&mut state, job.id(), server_job_id.clone())
            .await?;
        drop(state);
        if !dequeued && !marked {
            tracing::debug!(job_id = %job.id(), "synced job no longer queued or cached");
            return Ok(false);
        }

        tracing::info!(
            job_id = %job.id(),
            server_job_id = server_job_id.as_deref().unwrap_or("-"),
            "job synced"
        );
        self.emit(EngineEvent::JobSynced {
            job_id: job.id().to_string(),
            server_job_id,
            status: SyncStatus::Synced,
        });
        if let Some(updates) = updates {
            self.emit_updates(job, updates);
        }
        Ok(true)
    }

    fn emit_updates(&self, job: &Job, updates: Value) {
        self.emit(EngineEvent::Sync {
            job_id: job.id().to_string(),
            field_id: job.field_id().to_string(),
            updates,
        });
    }

    async fn record_failure(&self, job: &Job, message: String) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        if !state.queue.iter().any(|q| q.id() == job.id()) {
            return Ok(false);
        }
        let policy = &self.inner.config.backoff;
        let now = self.now_ms();
        let meta = RetryMeta::record_failure(
            state.retry.get(job.id()),
            policy,
            now,
            fastrand::f64(),
            message.as_str(),
        );
        tracing::warn!(
            job_id = %job.id(),
            attempts = meta.attempts,
            retry_in_ms = meta.next_retry.saturating_sub(now),
            error = %message,
            "sync attempt failed"
        );
        if policy.is_exhausted(meta.attempts) {
            tracing::warn!(job_id = %job.id(), attempts = meta.attempts, "giving up on job, leaving it queued");
        }
        state.retry.insert(job.id().to_string(), meta);
        self.persist_retry(&state).await?;
        Ok(false)
    }

    /// Add a job to the outbox unless it is already queued.
    pub(crate) async fn enqueue_locked(
        &self,
        state: &mut EngineState,
        job: &Job,
    ) -> Result<(), EngineError> {
        if state.queue.iter().any(|q| q.id() == job.id()) {
            tracing::debug!(job_id = %job.id(), "job already queued");
            return Ok(());
        }
        state.queue.push(job.clone());
        if let Err(e) = self.persist_queue(state).await {
            state.queue.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Drop a job and its retry state from the outbox. Returns false if it
    /// was not queued.
    pub(crate) async fn dequeue_locked(
        &self,
        state: &mut EngineState,
        job_id: &str,
    ) -> Result<bool, EngineError> {
        let before = state.queue.len();
        state.queue.retain(|q| q.id() != job_id);
        let removed = state.queue.len() != before;
        if removed {
            self.persist_queue(state).await?;
        }
        if state.retry.remove(job_id).is_some() {
            self.persist_retry(state).await?;
        }
        Ok(removed)
    }

    async fn persist_queue(&self, state: &EngineState) -> Result<(), EngineError> {
        write_json(self.store(), keys::SYNC_QUEUE, &state.queue).await?;
        Ok(())
    }

    async fn persist_retry(&self, state: &EngineState) -> Result<(), EngineError> {
        write_json(self.store(), keys::RETRY_META, &state.retry).await?;
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Spawn a drain pass in the background when background sync is on.
    pub(crate) fn trigger_drain(&self) {
        if !self.inner.config.background_sync {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drain().await;
        });
    }

    pub(crate) fn start_sync_timer(&self) {
        if !self.inner.config.background_sync {
            return;
        }
        let mut timers = self.inner.timers.lock();
        if timers.sync.is_some() {
            return;
        }
        let weak = self.downgrade();
        timers.sync = Some(every_interval(self.inner.config.sync_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(engine) = Engine::upgrade(&weak) {
                    engine.drain().await;
                }
            }
        }));
    }

    /// Every queued job in queue order, with its retry state.
    pub async fn get_pending_jobs(&self) -> Vec<PendingJob> {
        let state = self.inner.state.lock().await;
        let policy = &self.inner.config.backoff;
        state
            .queue
            .iter()
            .map(|job| {
                let retry = state.retry.get(job.id()).cloned();
                let abandoned = retry.as_ref().is_some_and(|m| policy.is_exhausted(m.attempts));
                PendingJob {
                    job: job.clone(),
                    retry,
                    abandoned,
                }
            })
            .collect()
    }
}
