// ABOUTME: The Engine handle: owns in-memory state behind one async mutex plus injected store, transport and clock.
// ABOUTME: Lifecycle (initialize/cleanup/reset), event wiring, timers and diagnostics live here.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use fieldlog_core::clock::ms_to_datetime;
use fieldlog_core::{
    BatchState, ChangeEvent, Clock, EngineEvent, Job, JobIndex, Recording, RetryMeta,
};
use fieldlog_store::{KvStore, StagingLog, keys, read_json, read_list, write_json};
use fieldlog_sync::SyncTransport;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};

use crate::bus::{EventBus, ListenerId};
use crate::config::EngineConfig;
use crate::connectivity::{AppState, ConnectivityMonitor, NetworkState};
use crate::error::EngineError;
use crate::scheduler::{IntervalHandle, every_interval};

/// Cheap-to-clone handle to a running engine. All clones share state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) transport: Arc<dyn SyncTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) bus: EventBus,
    pub(crate) draining: AtomicBool,
    /// Fields with a public `stop` in flight.
    pub(crate) stopping: parking_lot::Mutex<HashSet<String>>,
    pub(crate) timers: parking_lot::Mutex<Timers>,
    pub(crate) staging: StagingLog<Job>,
}

#[derive(Default)]
pub(crate) struct Timers {
    pub(crate) ticker: Option<IntervalHandle>,
    pub(crate) sync: Option<IntervalHandle>,
    pub(crate) connectivity: Option<ConnectivityMonitor>,
}

/// Everything the engine keeps in memory. Cached jobs themselves live only
/// in the store; the index points at them.
#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) initialized: bool,
    /// field id -> active recording
    pub(crate) active: BTreeMap<String, Recording>,
    pub(crate) batch: Option<BatchState>,
    /// The persisted batch no longer matches `batch`.
    pub(crate) batch_dirty: bool,
    pub(crate) index: JobIndex,
    pub(crate) queue: Vec<Job>,
    pub(crate) retry: BTreeMap<String, RetryMeta>,
    pub(crate) meta: EngineMeta,
    pub(crate) ticks: u64,
}

impl EngineState {
    pub(crate) fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    pub(crate) fn any_running(&self) -> bool {
        self.active.values().any(Recording::is_running)
    }

    pub(crate) fn active_snapshot(&self) -> Vec<Recording> {
        self.active.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EngineMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_hydration: Option<u64>,
}

/// Diagnostic counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub active_recordings: usize,
    pub running_recordings: usize,
    pub cached_jobs: usize,
    pub pending_sync: usize,
    pub retrying: usize,
    pub abandoned: usize,
    pub batch_active: bool,
    pub last_hydration: Option<DateTime<Utc>>,
    pub draining: bool,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                transport,
                clock,
                state: Mutex::new(EngineState::default()),
                bus: EventBus::new(),
                draining: AtomicBool::new(false),
                stopping: parking_lot::Mutex::new(HashSet::new()),
                timers: parking_lot::Mutex::new(Timers::default()),
                staging: StagingLog::new(keys::COMPLETION_STAGING),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.inner.clock.epoch_ms()
    }

    pub(crate) fn store(&self) -> &dyn KvStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.inner.bus.emit(event);
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<EngineInner>) -> Option<Engine> {
        weak.upgrade().map(|inner| Engine { inner })
    }

    /// Run `op` on its own task. Dropping the caller's future does not
    /// interrupt a multi-step write halfway.
    pub(crate) async fn run_detached<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce(Engine) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.clone())).await?
    }

    /// Register a synchronous listener for every engine event.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    /// Load persisted state, recover interrupted completions, start timers
    /// and emit `ready`. When `field_ids` is non-empty, recent server jobs for
    /// those fields are hydrated afterwards; hydration failures are logged
    /// and do not fail initialization. Calling it twice is a no-op.
    pub async fn initialize(&self, field_ids: &[String]) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.initialized {
                tracing::debug!("engine already initialized");
                return Ok(());
            }
            let now = self.now_ms();

            state.active = self.load_active(now).await?;
            state.batch = read_json(self.store(), keys::BATCH).await?;
            state.queue = read_list(self.store(), keys::SYNC_QUEUE).await?;
            state.retry = read_json(self.store(), keys::RETRY_META)
                .await?
                .unwrap_or_default();
            state.meta = read_json(self.store(), keys::META).await?.unwrap_or_default();
            state.index = self.load_index().await?;

            let replayed = self.replay_staged(&mut state).await?;
            self.persist_active(&state).await?;
            let swept = self.sweep_expired(&mut state).await?;

            state.initialized = true;
            tracing::info!(
                active = state.active.len(),
                queued = state.queue.len(),
                cached = state.index.len(),
                replayed,
                swept,
                batch = state.batch.is_some(),
                "engine initialized"
            );

            self.emit(EngineEvent::Change(ChangeEvent::Loaded {
                active: state.active_snapshot(),
            }));
            self.sync_ticker(&state);
            self.start_sync_timer();
            self.emit(EngineEvent::Ready);
        }

        if !field_ids.is_empty()
            && let Err(e) = self.hydrate(field_ids, false).await
        {
            tracing::warn!(error = %e, "hydration during initialize failed");
        }
        self.trigger_drain();
        Ok(())
    }

    /// Stop every timer and monitor, bring elapsed times up to date and
    /// persist them. The engine can be initialized again afterwards.
    pub async fn cleanup(&self) -> Result<(), EngineError> {
        {
            let mut timers = self.inner.timers.lock();
            if let Some(ticker) = timers.ticker.take() {
                ticker.stop();
            }
            if let Some(sync) = timers.sync.take() {
                sync.stop();
            }
            if let Some(monitor) = timers.connectivity.take() {
                monitor.stop();
            }
        }

        let mut state = self.inner.state.lock().await;
        if !state.initialized {
            return Ok(());
        }
        let now = self.now_ms();
        for recording in state.active.values_mut() {
            recording.accrue(now);
        }
        self.persist_active(&state).await?;
        if state.batch_dirty {
            self.persist_batch(&mut state).await?;
        }
        state.initialized = false;
        tracing::info!(active = state.active.len(), "engine cleaned up");
        Ok(())
    }

    /// Erase every persisted key and all in-memory state, then emit
    /// `change{reset}`. The engine stays initialized: the sync timer and any
    /// attached connectivity monitor keep running and drain the now empty
    /// queue, so jobs recorded after the reset still sync.
    pub async fn reset(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;

        let doomed = self.store().keys_with_prefix(keys::NAMESPACE).await?;
        self.store().multi_remove(&doomed).await?;

        let initialized = state.initialized;
        *state = EngineState {
            initialized,
            ..EngineState::default()
        };
        self.sync_ticker(&state);
        tracing::info!(keys = doomed.len(), "engine reset");
        self.emit(EngineEvent::Change(ChangeEvent::Reset));
        Ok(())
    }

    pub async fn get_stats(&self) -> EngineStats {
        let state = self.inner.state.lock().await;
        let policy = &self.inner.config.backoff;
        let abandoned = state
            .queue
            .iter()
            .filter(|job| {
                state
                    .retry
                    .get(job.id())
                    .is_some_and(|m| policy.is_exhausted(m.attempts))
            })
            .count();
        let retrying = state
            .queue
            .iter()
            .filter(|job| state.retry.contains_key(job.id()))
            .count()
            - abandoned;

        EngineStats {
            active_recordings: state.active.len(),
            running_recordings: state.active.values().filter(|r| r.is_running()).count(),
            cached_jobs: state.index.len(),
            pending_sync: state.queue.len(),
            retrying,
            abandoned,
            batch_active: state.batch.is_some(),
            last_hydration: state.meta.last_hydration.map(ms_to_datetime),
            draining: self.is_draining(),
        }
    }

    /// Wire platform connectivity signals to the sync drain. Replaces any
    /// previously attached monitor.
    pub fn attach_connectivity(
        &self,
        network: watch::Receiver<NetworkState>,
        app: watch::Receiver<AppState>,
    ) {
        let weak = self.downgrade();
        let monitor = ConnectivityMonitor::spawn(network, app, move |reason| {
            let weak = weak.clone();
            async move {
                if let Some(engine) = Engine::upgrade(&weak) {
                    let report = engine.drain().await;
                    tracing::debug!(?reason, ?report, "drain after wake");
                }
            }
        });
        self.inner.timers.lock().connectivity = Some(monitor);
    }

    /// Start or stop the clock ticker so it runs exactly while some recording
    /// is running.
    pub(crate) fn sync_ticker(&self, state: &EngineState) {
        let mut timers = self.inner.timers.lock();
        let running = state.initialized && state.any_running();
        match (running, timers.ticker.is_some()) {
            (true, false) => {
                let weak = self.downgrade();
                timers.ticker = Some(every_interval(self.inner.config.tick_interval, move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(engine) = Engine::upgrade(&weak) {
                            engine.tick().await;
                        }
                    }
                }));
                tracing::debug!("clock started");
            }
            (false, true) => {
                if let Some(ticker) = timers.ticker.take() {
                    ticker.stop();
                }
                tracing::debug!("clock stopped");
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn ticker_running(&self) -> bool {
        self.inner.timers.lock().ticker.is_some()
    }

    async fn load_active(&self, now: u64) -> Result<BTreeMap<String, Recording>, EngineError> {
        let recordings: Vec<Recording> = read_list(self.store(), keys::ACTIVE_RECORDINGS).await?;
        let mut active = BTreeMap::new();
        for mut recording in recordings {
            if recording.status == fieldlog_core::RecordingStatus::Completed {
                continue;
            }
            if active.contains_key(&recording.field_id) {
                tracing::warn!(field_id = %recording.field_id, "dropping duplicate persisted recording");
                continue;
            }
            // Field work carries on while the app is closed.
            recording.accrue(now);
            active.insert(recording.field_id.clone(), recording);
        }
        Ok(active)
    }

    pub(crate) async fn persist_active(&self, state: &EngineState) -> Result<(), EngineError> {
        let snapshot: Vec<&Recording> = state.active.values().collect();
        write_json(self.store(), keys::ACTIVE_RECORDINGS, &snapshot).await?;
        Ok(())
    }

    pub(crate) async fn write_batch(&self, batch: Option<&BatchState>) -> Result<(), EngineError> {
        match batch {
            Some(batch) => write_json(self.store(), keys::BATCH, batch).await?,
            None => self.store().remove(keys::BATCH).await?,
        }
        Ok(())
    }

    /// Write the in-memory batch. A failed write marks it dirty so
    /// `flush_batch` can retry later.
    pub(crate) async fn persist_batch(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let result = self.write_batch(state.batch.as_ref()).await;
        state.batch_dirty = result.is_err();
        result
    }

    /// Retry a batch write that failed earlier. Errors are logged.
    pub(crate) async fn flush_batch(&self, state: &mut EngineState) {
        if !state.batch_dirty {
            return;
        }
        match self.persist_batch(state).await {
            Ok(()) => tracing::info!("stale persisted batch rewritten"),
            Err(e) => tracing::warn!(error = %e, "persisted batch still stale"),
        }
    }

    pub(crate) async fn persist_meta(&self, state: &EngineState) -> Result<(), EngineError> {
        write_json(self.store(), keys::META, &state.meta).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fieldlog_core::ChangeEvent;
    use fieldlog_store::keys;
    use parking_lot::Mutex as SyncMutex;

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn operations_require_initialize() {
        let h = Harness::new();
        let err = h.engine.start("f1", SPRAY, field("North")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized));
    }

    #[tokio::test]
    async fn initialize_emits_loaded_then_ready() {
        let h = Harness::new();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        h.engine.on(move |e| s.lock().push(e.clone()));

        h.engine.initialize(&[]).await.unwrap();
        h.engine.initialize(&[]).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], EngineEvent::Change(ChangeEvent::Loaded { .. })));
        assert_eq!(seen[1], EngineEvent::Ready);
    }

    #[tokio::test]
    async fn restart_credits_running_recordings_for_downtime() {
        let h = Harness::new().ready().await;
        h.engine.start("f1", SPRAY, field("North")).await.unwrap();
        h.engine.start("f2", SPRAY, field("South")).await.unwrap();
        h.clock.advance(Duration::from_secs(2));
        h.engine.pause("f2").await.unwrap();
        h.engine.cleanup().await.unwrap();

        h.clock.advance(Duration::from_secs(60));
        let restarted = h.restart().ready().await;

        let f1 = restarted.engine.get_active("f1").await.unwrap();
        let f2 = restarted.engine.get_active("f2").await.unwrap();
        assert_eq!(f1.elapsed_time, 62_000);
        assert_eq!(f2.elapsed_time, 2_000);
    }

    #[tokio::test]
    async fn corrupt_active_blob_is_ignored() {
        let store = fieldlog_store::MemoryStore::new();
        store
            .set(keys::ACTIVE_RECORDINGS, "{definitely not json")
            .await
            .unwrap();
        let h = Harness::on_store(quiet_config(), store, fieldlog_core::FakeClock::new())
            .ready()
            .await;

        assert!(h.engine.get_all_active().await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let h = Harness::new().ready().await;
        h.engine.start("f1", SPRAY, field("North")).await.unwrap();
        h.engine.start("f2", SPRAY, field("South")).await.unwrap();
        h.engine.stop("f2").await.unwrap();
        let mut rx = h.engine.subscribe();

        h.engine.reset().await.unwrap();

        assert!(h.store.is_empty());
        let stats = h.engine.get_stats().await;
        assert_eq!(stats.active_recordings, 0);
        assert_eq!(stats.cached_jobs, 0);
        assert_eq!(stats.pending_sync, 0);
        assert!(!h.engine.ticker_running());
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::Change(ChangeEvent::Reset)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sync_keeps_running_after_reset() {
        let h = Harness::with_config(EngineConfig {
            background_sync: true,
            sync_interval: Duration::from_secs(30),
            ..quiet_config()
        })
        .ready()
        .await;
        h.engine.start("f1", SPRAY, field("North")).await.unwrap();
        h.engine.stop("f1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.engine.reset().await.unwrap();

        h.transport.push_status(500, serde_json::Value::Null);
        h.engine.start("f2", SPRAY, field("South")).await.unwrap();
        h.engine.stop("f2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.engine.get_stats().await.retrying, 1);

        // Only the periodic drain can pick up the retry now.
        h.clock.advance(Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(h.engine.get_pending_jobs().await.is_empty());
        let posts = h.transport.posts();
        assert_eq!(posts.len(), 3);
        assert_eq!(posts[2].body["fieldId"], "f2");
    }

    #[tokio::test]
    async fn stats_count_queue_and_retries() {
        let h = Harness::new().ready().await;
        h.engine.start("f1", SPRAY, field("North")).await.unwrap();
        h.engine.stop("f1").await.unwrap();
        h.transport.push_status(500, serde_json::Value::Null);
        h.engine.drain().await;

        let stats = h.engine.get_stats().await;
        assert_eq!(stats.cached_jobs, 1);
        assert_eq!(stats.pending_sync, 1);
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.abandoned, 0);
        assert!(!stats.draining);
    }

    #[tokio::test]
    async fn cleanup_stops_the_clock() {
        let h = Harness::new().ready().await;
        h.engine.start("f1", SPRAY, field("North")).await.unwrap();
        assert!(h.engine.ticker_running());

        h.engine.cleanup().await.unwrap();
        assert!(!h.engine.ticker_running());
    }
}
