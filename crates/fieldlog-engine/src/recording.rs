// ABOUTME: Active recording lifecycle: start, pause, resume, stop and the clock tick.
// ABOUTME: At most one recording per field; every transition is persisted before returning.

use fieldlog_core::{ChangeEvent, EngineEvent, Job, JobData, JobType, Recording};

use crate::engine::{Engine, EngineState};
use crate::error::EngineError;

/// Marks a field as being stopped until dropped.
struct StoppingGuard {
    engine: Engine,
    field_id: String,
}

impl StoppingGuard {
    fn claim(engine: &Engine, field_id: &str) -> Option<Self> {
        engine
            .inner
            .stopping
            .lock()
            .insert(field_id.to_string())
            .then(|| Self {
                engine: engine.clone(),
                field_id: field_id.to_string(),
            })
    }
}

impl Drop for StoppingGuard {
    fn drop(&mut self) {
        self.engine.inner.stopping.lock().remove(&self.field_id);
    }
}

impl Engine {
    /// Start timing `job_type` work on `field_id`.
    pub async fn start(
        &self,
        field_id: &str,
        job_type: JobType,
        job: JobData,
    ) -> Result<Recording, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        self.start_locked(&mut state, field_id, job_type, job).await
    }

    pub(crate) async fn start_locked(
        &self,
        state: &mut EngineState,
        field_id: &str,
        job_type: JobType,
        job: JobData,
    ) -> Result<Recording, EngineError> {
        if state.active.contains_key(field_id) {
            return Err(EngineError::AlreadyActive {
                field_id: field_id.to_string(),
            });
        }
        let max = self.inner.config.max_concurrent_recordings;
        if state.active.len() >= max {
            return Err(EngineError::CapacityExceeded { max });
        }

        let recording = Recording::start(field_id, job_type, job, self.now_ms());
        state
            .active
            .insert(field_id.to_string(), recording.clone());
        if let Err(e) = self.persist_active(state).await {
            state.active.remove(field_id);
            return Err(e);
        }

        tracing::info!(field_id, job_id = %recording.id, job_type = %job_type, "recording started");
        self.sync_ticker(state);
        self.emit(EngineEvent::Change(ChangeEvent::Start {
            recording: recording.clone(),
        }));
        Ok(recording)
    }

    /// Returns `Ok(false)` when the field has no running recording.
    pub async fn pause(&self, field_id: &str) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        let now = self.now_ms();
        let Some(recording) = state.active.get_mut(field_id) else {
            return Ok(false);
        };
        if !recording.pause(now) {
            return Ok(false);
        }
        let snapshot = recording.clone();
        self.persist_active(&state).await?;

        tracing::info!(field_id, elapsed_ms = snapshot.elapsed_time, "recording paused");
        self.sync_ticker(&state);
        self.emit(EngineEvent::Change(ChangeEvent::Pause {
            recording: snapshot,
        }));
        Ok(true)
    }

    /// Returns `Ok(false)` when the field has no paused recording.
    pub async fn resume(&self, field_id: &str) -> Result<bool, EngineError> {
        let mut state = self.inner.state.lock().await;
        state.ensure_initialized()?;
        let now = self.now_ms();
        let Some(recording) = state.active.get_mut(field_id) else {
            return Ok(false);
        };
        if !recording.resume(now) {
            return Ok(false);
        }
        let snapshot = recording.clone();
        self.persist_active(&state).await?;

        tracing::info!(field_id, "recording resumed");
        self.sync_ticker(&state);
        self.emit(EngineEvent::Change(ChangeEvent::Resume {
            recording: snapshot,
        }));
        Ok(true)
    }

    /// Finalize the field's recording into a cached, queued Job. Returns
    /// `Ok(None)` if the field has no recording or a stop for it is already
    /// in flight. Once started, the completion runs to the end even if the
    /// returned future is dropped.
    pub async fn stop(&self, field_id: &str) -> Result<Option<Job>, EngineError> {
        let Some(claim) = StoppingGuard::claim(self, field_id) else {
            tracing::warn!(field_id, "stop already in progress, ignoring");
            return Ok(None);
        };
        let job = self
            .run_detached(move |engine| async move {
                let mut state = engine.inner.state.lock().await;
                state.ensure_initialized()?;
                let result = engine.stop_locked(&mut state, &claim.field_id).await;
                drop(claim);
                result
            })
            .await?;
        if job.is_some() {
            self.trigger_drain();
        }
        Ok(job)
    }

    pub(crate) async fn stop_locked(
        &self,
        state: &mut EngineState,
        field_id: &str,
    ) -> Result<Option<Job>, EngineError> {
        let Some(recording) = state.active.get(field_id).cloned() else {
            return Ok(None);
        };
        self.complete_recording(state, recording).await.map(Some)
    }

    pub async fn get_active(&self, field_id: &str) -> Option<Recording> {
        self.inner.state.lock().await.active.get(field_id).cloned()
    }

    pub async fn get_all_active(&self) -> Vec<Recording> {
        self.inner.state.lock().await.active_snapshot()
    }

    pub async fn has_active(&self, field_id: &str) -> bool {
        self.inner.state.lock().await.active.contains_key(field_id)
    }

    /// Advance every running recording to now and publish a `tick`. The
    /// active blob is persisted every `persist_every_ticks` ticks.
    pub async fn tick(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.initialized {
            return;
        }
        let now = self.now_ms();
        for recording in state.active.values_mut() {
            recording.accrue(now);
        }
        state.ticks += 1;

        if state.ticks % self.inner.config.persist_every_ticks == 0 {
            if let Err(e) = self.persist_active(&state).await {
                tracing::error!(error = %e, "failed to persist active recordings on tick");
            }
            self.flush_batch(&mut state).await;
        }
        tracing::trace!(ticks = state.ticks, active = state.active.len(), "tick");
        self.emit(EngineEvent::Tick {
            active: state.active_snapshot(),
        });
    }
}
