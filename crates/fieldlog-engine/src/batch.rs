// ABOUTME: Multi-field batches: one shared job worked field by field, one recording at a time.
// ABOUTME: Batch state is persisted so a batch survives restarts between fields.

use fieldlog_core::clock::ms_to_datetime;
use fieldlog_core::{BatchState, BatchStatus, FieldPayload, Job, Recording};

use crate::engine::{Engine, EngineState};
use crate::error::EngineError;

impl Engine {
    /// Start a batch over `payloads` in order. The first payload supplies the
    /// shared job type, equipment and configuration, and its field starts
    /// recording immediately.
    pub async fn start_batch(&self, payloads: Vec<FieldPayload>) -> Result<Recording, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        if state.batch.is_some() {
            return Err(EngineError::BatchAlreadyActive);
        }
        let batch = BatchState::from_payloads(&payloads, ms_to_datetime(self.now_ms()))
            .ok_or(EngineError::EmptyBatch)?;
        let Some(first) = payloads.into_iter().next() else {
            return Err(EngineError::EmptyBatch);
        };

        let mut job = first.job;
        job.batch = Some(batch.batch_ref(0));
        let batch_id = batch.id.clone();
        let total_fields = batch.total_fields();
        self.write_batch(Some(&batch)).await?;
        state.batch = Some(batch);
        state.batch_dirty = false;

        match self
            .start_locked(&mut state, &first.field_id, first.job_type, job)
            .await
        {
            Ok(recording) => {
                tracing::info!(batch_id = %batch_id, total_fields, "batch started");
                Ok(recording)
            }
            Err(e) => {
                state.batch = None;
                if let Err(cleanup) = self.persist_batch(&mut state).await {
                    tracing::warn!(batch_id = %batch_id, error = %cleanup, "failed to discard batch");
                }
                Err(e)
            }
        }
    }

    /// Finish the current batch field and start `next_field_id`, which must
    /// still be pending. The batch is dissolved once its last pending field
    /// starts; that field's recording is later finished by `complete_batch`.
    ///
    /// If the next field fails to start after the current one was stopped,
    /// the batch keeps the stopped field's time and `next_field_id` stays
    /// pending, so the call can simply be repeated.
    pub async fn advance_batch(&self, next_field_id: &str) -> Result<Recording, EngineError> {
        let next_field_id = next_field_id.to_string();
        let recording = self
            .run_detached(move |engine| async move {
                let mut state = engine.inner.state.lock().await;
                state.ensure_initialized()?;
                engine.advance_batch_locked(&mut state, &next_field_id).await
            })
            .await?;
        self.trigger_drain();
        Ok(recording)
    }

    async fn advance_batch_locked(
        &self,
        state: &mut EngineState,
        next_field_id: &str,
    ) -> Result<Recording, EngineError> {
        let batch = state.batch.as_ref().ok_or(EngineError::NoActiveBatch)?;
        if !batch.is_pending(next_field_id) {
            return Err(EngineError::FieldNotPending {
                field_id: next_field_id.to_string(),
            });
        }
        let current = batch.current_field_id.clone();
        let current_finished = batch.current_finished;
        if !current_finished && !state.active.contains_key(&current) {
            return Err(EngineError::NoActiveRecording { field_id: current });
        }
        if state.active.contains_key(next_field_id) {
            return Err(EngineError::AlreadyActive {
                field_id: next_field_id.to_string(),
            });
        }

        if !current_finished {
            let finished = self
                .stop_locked(state, &current)
                .await?
                .ok_or_else(|| EngineError::NoActiveRecording {
                    field_id: current.clone(),
                })?;
            let batch = state.batch.as_mut().ok_or(EngineError::NoActiveBatch)?;
            batch.finish_current(finished.record.elapsed_time);
            // The stop is done; the disk copy catches up below.
            state.batch_dirty = true;
        }

        let mut advanced = state.batch.clone().ok_or(EngineError::NoActiveBatch)?;
        let payload = advanced
            .take_pending(next_field_id)
            .ok_or_else(|| EngineError::FieldNotPending {
                field_id: next_field_id.to_string(),
            })?;
        let batch_id = advanced.id.clone();
        let remaining = advanced.pending.len();
        let next_batch = (remaining > 0).then_some(advanced);
        self.write_batch(next_batch.as_ref()).await?;

        match self
            .start_locked(state, &payload.field_id, payload.job_type, payload.job)
            .await
        {
            Ok(recording) => {
                tracing::info!(
                    batch_id = %batch_id,
                    from = %current,
                    to = %recording.field_id,
                    remaining,
                    "batch advanced"
                );
                state.batch = next_batch;
                state.batch_dirty = false;
                Ok(recording)
            }
            Err(e) => {
                if let Err(restore) = self.persist_batch(state).await {
                    tracing::warn!(error = %restore, "failed to restore persisted batch");
                }
                Err(e)
            }
        }
    }

    /// Stop the batch's current field and dissolve the batch. The batch is
    /// cleared even when the stop fails.
    pub async fn complete_batch(&self) -> Result<Option<Job>, EngineError> {
        let job = self
            .run_detached(|engine| async move {
                let mut state = engine.inner.state.lock().await;
                state.ensure_initialized()?;
                engine.complete_batch_locked(&mut state).await
            })
            .await?;
        if job.is_some() {
            self.trigger_drain();
        }
        Ok(job)
    }

    async fn complete_batch_locked(&self, state: &mut EngineState) -> Result<Option<Job>, EngineError> {
        let current = match &state.batch {
            Some(batch) if batch.current_finished => None,
            Some(batch) => Some(batch.current_field_id.clone()),
            // After the last advance only the final batch recording is left.
            None => Some(
                state
                    .active
                    .values()
                    .filter(|r| r.batch.is_some())
                    .max_by_key(|r| r.started_at)
                    .map(|r| r.field_id.clone())
                    .ok_or(EngineError::NoActiveBatch)?,
            ),
        };

        // Cleared before stopping. A failed removal stays dirty and is
        // retried on the next successful stop, tick or cleanup.
        if let Some(batch) = state.batch.take() {
            if let Err(e) = self.persist_batch(state).await {
                tracing::warn!(batch_id = %batch.id, error = %e, "failed to clear persisted batch");
            }
            tracing::info!(batch_id = %batch.id, "batch completed");
        }

        match current {
            Some(field_id) => self.stop_locked(state, &field_id).await,
            None => Ok(None),
        }
    }

    /// Read-only view of the active batch, with the current field's elapsed
    /// time brought up to now.
    pub async fn get_batch_status(&self) -> Option<BatchStatus> {
        let state = self.inner.state.lock().await;
        let batch = state.batch.as_ref()?;
        let current_elapsed = state
            .active
            .get(&batch.current_field_id)
            .map_or(0, |recording| {
                let mut snapshot = recording.clone();
                snapshot.accrue(self.now_ms());
                snapshot.elapsed_time
            });
        Some(BatchStatus::compute(batch, current_elapsed))
    }

    pub async fn is_batch_active(&self) -> bool {
        self.inner.state.lock().await.batch.is_some()
    }

    pub async fn is_field_in_active_batch(&self, field_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .batch
            .as_ref()
            .is_some_and(|b| b.contains(field_id))
    }

    /// Drop the batch without stopping any recording. Returns false if no
    /// batch was active.
    pub async fn clear_batch_pending(&self) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        let Some(batch) = state.batch.take() else {
            return Ok(false);
        };
        self.persist_batch(&mut state).await?;
        tracing::info!(batch_id = %batch.id, pending = batch.pending.len(), "batch cleared");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fieldlog_core::{JobData, Reference};
    use fieldlog_store::{KvStore, keys};
    use serde_json::json;

    use crate::cache::JobQuery;
    use crate::engine::test_support::*;

    use super::*;

    fn payload(field_id: &str, area: f64) -> FieldPayload {
        let mut job = JobData::for_field(format!("Field {field_id}"), area);
        job.machine = Some(Reference::named("m1", "Sprayer"));
        job.data.insert("product".to_string(), json!("glyphosate"));
        FieldPayload::new(field_id, SPRAY, job)
    }

    fn abc() -> Vec<FieldPayload> {
        vec![payload("a", 1.0), payload("b", 2.0), payload("c", 3.0)]
    }

    #[tokio::test]
    async fn three_field_batch_yields_three_jobs() {
        let h = Harness::new().ready().await;
        let first = h.engine.start_batch(abc()).await.unwrap();
        assert_eq!(first.field_id, "a");
        assert_eq!(first.batch.as_ref().unwrap().field_index, 0);
        assert!(h.engine.is_field_in_active_batch("c").await);

        h.clock.advance(Duration::from_secs(5));
        let second = h.engine.advance_batch("b").await.unwrap();
        assert_eq!(second.machine, Some(Reference::named("m1", "Sprayer")));
        assert_eq!(second.data["product"], "glyphosate");

        let status = h.engine.get_batch_status().await.unwrap();
        assert_eq!(status.accumulated_time, 5_000);
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.current_field_id, "b");
        assert_eq!(status.pending_field_ids, vec!["c"]);

        h.clock.advance(Duration::from_secs(3));
        h.engine.advance_batch("c").await.unwrap();
        assert!(!h.engine.is_batch_active().await);
        assert!(h.store.get(keys::BATCH).await.unwrap().is_none());

        h.clock.advance(Duration::from_secs(2));
        let last = h.engine.complete_batch().await.unwrap().unwrap();
        assert_eq!(last.field_id(), "c");
        assert!(h.engine.get_all_active().await.is_empty());

        let jobs = h.engine.get_by_type(SPRAY, &JobQuery::new()).await.unwrap();
        assert_eq!(jobs.len(), 3);
        let batch_id = &first.batch.as_ref().unwrap().id;
        let mut placed: Vec<(String, usize, u64)> = jobs
            .iter()
            .map(|j| {
                let batch = j.record.batch.as_ref().unwrap();
                assert_eq!(&batch.id, batch_id);
                assert_eq!(batch.total_fields, 3);
                (j.field_id().to_string(), batch.field_index, j.record.elapsed_time)
            })
            .collect();
        placed.sort();
        assert_eq!(
            placed,
            vec![
                ("a".to_string(), 0, 5_000),
                ("b".to_string(), 1, 3_000),
                ("c".to_string(), 2, 2_000),
            ]
        );
        assert_eq!(h.engine.get_pending_jobs().await.len(), 3);
    }

    #[tokio::test]
    async fn status_reports_live_elapsed_without_mutating() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();
        h.clock.advance(Duration::from_secs(4));

        let status = h.engine.get_batch_status().await.unwrap();
        assert_eq!(status.total_elapsed_time, 4_000);
        assert_eq!(status.total_fields, 3);
        assert_eq!(status.total_area, 6.0);
        assert_eq!(h.engine.get_active("a").await.unwrap().elapsed_time, 0);
    }

    #[tokio::test]
    async fn start_batch_validates_input_and_exclusivity() {
        let h = Harness::new().ready().await;
        assert!(matches!(
            h.engine.start_batch(Vec::new()).await,
            Err(EngineError::EmptyBatch)
        ));

        h.engine.start_batch(abc()).await.unwrap();
        assert!(matches!(
            h.engine.start_batch(vec![payload("x", 1.0)]).await,
            Err(EngineError::BatchAlreadyActive)
        ));
    }

    #[tokio::test]
    async fn failed_first_start_discards_batch() {
        let h = Harness::new().ready().await;
        h.engine.start("a", SPRAY, field("Busy")).await.unwrap();

        let err = h.engine.start_batch(abc()).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActive { .. }));
        assert!(!h.engine.is_batch_active().await);
        assert!(h.store.get(keys::BATCH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn advance_rejects_misuse_without_side_effects() {
        let h = Harness::new().ready().await;
        assert!(matches!(
            h.engine.advance_batch("b").await,
            Err(EngineError::NoActiveBatch)
        ));

        h.engine.start_batch(abc()).await.unwrap();
        assert!(matches!(
            h.engine.advance_batch("zzz").await,
            Err(EngineError::FieldNotPending { .. })
        ));
        assert!(matches!(
            h.engine.advance_batch("a").await,
            Err(EngineError::FieldNotPending { .. })
        ));
        assert!(h.engine.has_active("a").await);

        h.engine.stop("a").await.unwrap();
        let err = h.engine.advance_batch("b").await.unwrap_err();
        assert!(matches!(err, EngineError::NoActiveRecording { ref field_id } if field_id == "a"));
        assert_eq!(h.engine.get_batch_status().await.unwrap().pending_field_ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn complete_batch_mid_way_leaves_pending_fields_unrecorded() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();
        h.engine.advance_batch("b").await.unwrap();

        let job = h.engine.complete_batch().await.unwrap().unwrap();
        assert_eq!(job.field_id(), "b");
        assert!(!h.engine.is_batch_active().await);
        assert!(h.engine.get_history("c", &JobQuery::new()).await.unwrap().is_empty());
        assert!(matches!(
            h.engine.complete_batch().await,
            Err(EngineError::NoActiveBatch)
        ));
    }

    #[tokio::test]
    async fn complete_batch_clears_state_even_when_stop_fails() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();

        h.store.set_fail_writes(true);
        assert!(h.engine.complete_batch().await.is_err());
        h.store.set_fail_writes(false);

        assert!(!h.engine.is_batch_active().await);
        assert!(h.engine.has_active("a").await);

        h.engine.cleanup().await.unwrap();
        let restarted = h.restart().ready().await;
        assert!(!restarted.engine.is_batch_active().await);
        assert!(restarted.engine.has_active("a").await);
    }

    #[tokio::test]
    async fn advance_with_failing_batch_write_can_be_repeated() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();
        h.clock.advance(Duration::from_secs(5));

        h.store.set_fail_key(keys::BATCH, true);
        assert!(h.engine.advance_batch("b").await.is_err());

        // "a" is recorded; "b" has not started and is still pending.
        assert_eq!(h.engine.get_history("a", &JobQuery::new()).await.unwrap().len(), 1);
        assert!(h.engine.get_all_active().await.is_empty());
        let status = h.engine.get_batch_status().await.unwrap();
        assert_eq!(status.accumulated_time, 5_000);
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.pending_field_ids, vec!["b", "c"]);

        h.store.set_fail_key(keys::BATCH, false);
        let second = h.engine.advance_batch("b").await.unwrap();
        assert_eq!(second.field_id, "b");
        let status = h.engine.get_batch_status().await.unwrap();
        assert_eq!(status.current_field_id, "b");
        assert_eq!(status.accumulated_time, 5_000);
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.pending_field_ids, vec!["c"]);

        h.clock.advance(Duration::from_secs(2));
        h.engine.advance_batch("c").await.unwrap();
        h.engine.complete_batch().await.unwrap();
        assert_eq!(h.engine.get_by_type(SPRAY, &JobQuery::new()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_advance_is_written_through_before_restart() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();
        h.clock.advance(Duration::from_secs(4));
        h.store.set_fail_key(keys::BATCH, true);
        assert!(h.engine.advance_batch("c").await.is_err());
        h.store.set_fail_key(keys::BATCH, false);

        h.engine.cleanup().await.unwrap();
        let restarted = h.restart().ready().await;

        let status = restarted.engine.get_batch_status().await.unwrap();
        assert_eq!(status.accumulated_time, 4_000);
        assert_eq!(status.pending_field_ids, vec!["b", "c"]);
        restarted.engine.advance_batch("c").await.unwrap();
        assert!(restarted.engine.has_active("c").await);
    }

    #[tokio::test]
    async fn complete_after_failed_advance_only_clears_the_batch() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();
        h.store.set_fail_key(keys::BATCH, true);
        assert!(h.engine.advance_batch("b").await.is_err());
        h.store.set_fail_key(keys::BATCH, false);

        assert!(h.engine.complete_batch().await.unwrap().is_none());
        assert!(!h.engine.is_batch_active().await);
        assert!(h.store.get(keys::BATCH).await.unwrap().is_none());
        assert_eq!(h.engine.get_pending_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn batch_survives_restart() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();
        h.clock.advance(Duration::from_secs(5));
        h.engine.advance_batch("c").await.unwrap();
        h.engine.cleanup().await.unwrap();

        let restarted = h.restart().ready().await;
        let status = restarted.engine.get_batch_status().await.unwrap();
        assert_eq!(status.current_field_id, "c");
        assert_eq!(status.pending_field_ids, vec!["b"]);
        assert_eq!(status.accumulated_time, 5_000);

        restarted.engine.advance_batch("b").await.unwrap();
        assert!(!restarted.engine.is_batch_active().await);
    }

    #[tokio::test]
    async fn clear_batch_pending_keeps_recordings() {
        let h = Harness::new().ready().await;
        h.engine.start_batch(abc()).await.unwrap();

        assert!(h.engine.clear_batch_pending().await.unwrap());
        assert!(!h.engine.clear_batch_pending().await.unwrap());
        assert!(!h.engine.is_field_in_active_batch("b").await);
        assert!(h.engine.has_active("a").await);
    }
}
