// ABOUTME: Crash-safe completion of a recording: stage, drop from active, cache, enqueue, commit.
// ABOUTME: Staged entries left behind by a crash are replayed during initialize.

use fieldlog_core::{ChangeEvent, EngineEvent, Job, Recording};
use fieldlog_store::keys;

use crate::engine::{Engine, EngineState};
use crate::error::EngineError;

impl Engine {
    /// Turn an active recording into a cached, queued Job.
    ///
    /// Each step is durable before the next starts, and every step is safe to
    /// repeat, so a crash anywhere leaves enough in the staging log for
    /// `replay_staged` to finish the job. An error returned here means the
    /// recording is still active.
    pub(crate) async fn complete_recording(
        &self,
        state: &mut EngineState,
        recording: Recording,
    ) -> Result<Job, EngineError> {
        let now = self.now_ms();
        let mut finished = recording.clone();
        finished.complete(now);
        let job = Job::from_recording(finished, now, self.inner.config.cache_ttl_ms());
        let field_id = job.field_id().to_string();

        self.inner
            .staging
            .append(self.store(), job.id(), &job, now)
            .await?;

        if let Err(e) = self.finish_staged(state, &job).await {
            tracing::warn!(field_id = %field_id, job_id = %job.id(), error = %e, "stop failed, rolling back");
            self.roll_back_completion(state, recording, &job).await;
            return Err(e);
        }
        if let Err(e) = self.inner.staging.commit(self.store(), job.id()).await {
            // Cached and queued already; replay drops the leftover entry.
            tracing::warn!(job_id = %job.id(), error = %e, "failed to clear staged completion");
        }
        self.flush_batch(state).await;

        tracing::info!(
            field_id = %field_id,
            job_id = %job.id(),
            elapsed_ms = job.record.elapsed_time,
            "recording stopped"
        );
        self.sync_ticker(state);
        self.emit(EngineEvent::Change(ChangeEvent::Stop {
            job: Box::new(job.clone()),
        }));
        Ok(job)
    }

    async fn finish_staged(&self, state: &mut EngineState, job: &Job) -> Result<(), EngineError> {
        state.active.remove(job.field_id());
        self.persist_active(state).await?;
        self.cache_job_locked(state, job).await?;
        self.enqueue_locked(state, job).await
    }

    /// Put `recording` back and undo whatever part of its completion landed.
    /// The staged entry is dropped only when every undo step succeeded;
    /// otherwise `initialize` finishes the job from it.
    async fn roll_back_completion(&self, state: &mut EngineState, recording: Recording, job: &Job) {
        state.active.insert(recording.field_id.clone(), recording);

        let mut undone = true;
        if let Err(e) = self.dequeue_locked(state, job.id()).await {
            tracing::warn!(job_id = %job.id(), error = %e, "rollback: failed to dequeue job");
            undone = false;
        }
        if let Err(e) = self.remove_cached_locked(state, job.id()).await {
            tracing::warn!(job_id = %job.id(), error = %e, "rollback: failed to uncache job");
            undone = false;
        }
        if let Err(e) = self.persist_active(state).await {
            tracing::warn!(job_id = %job.id(), error = %e, "rollback: failed to persist active recordings");
            undone = false;
        }
        if !undone {
            return;
        }
        if let Err(e) = self.inner.staging.commit(self.store(), job.id()).await {
            tracing::warn!(job_id = %job.id(), error = %e, "rollback: failed to drop staged completion");
        }
    }

    /// Finish every completion interrupted by a crash. Returns the number of
    /// staged entries processed.
    pub(crate) async fn replay_staged(&self, state: &mut EngineState) -> Result<usize, EngineError> {
        let entries = self.inner.staging.entries(self.store()).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        for entry in &entries {
            let job = &entry.payload;

            // Crash before the recording left the active set.
            let leftover = state
                .active
                .iter()
                .find(|(_, rec)| rec.id == job.id())
                .map(|(field, _)| field.clone());
            if let Some(field_id) = leftover {
                state.active.remove(&field_id);
                tracing::info!(
                    field_id = %field_id,
                    job_id = %job.id(),
                    "removed recording finalized before crash"
                );
            }

            let cached = self.store().get(&keys::job_key(job.id())).await?.is_some();
            if cached {
                // Steps 3 and 4 ran; make sure the index and queue agree.
                if !state.index.contains(job.id()) {
                    state.index.insert(job.id(), job.field_id(), job.job_type());
                    self.persist_index(state).await?;
                }
                let queued = state.queue.iter().any(|q| q.id() == job.id());
                if !queued && !self.is_synced_in_cache(job.id()).await? {
                    self.enqueue_locked(state, job).await?;
                }
            } else {
                self.cache_job_locked(state, job).await?;
                self.enqueue_locked(state, job).await?;
            }
            self.inner.staging.commit(self.store(), &entry.id).await?;
            tracing::info!(job_id = %job.id(), "replayed staged completion");
        }
        Ok(entries.len())
    }
}
