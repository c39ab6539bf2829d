// ABOUTME: End-to-end tests of the engine through its public API.
// ABOUTME: Covers recording, batches, crash recovery, sync retries and durability on SQLite.

use std::sync::Arc;
use std::time::Duration;

use fieldlog_core::{
    EngineEvent, FakeClock, FieldPayload, Job, JobData, JobType, Recording, Reference,
    SyncStatus,
};
use fieldlog_engine::{AppState, Engine, EngineConfig, EngineError, JobQuery, NetworkState};
use fieldlog_store::{KvStore, MemoryStore, SqliteStore, StagingLog, keys, write_json};
use fieldlog_sync::ScriptedTransport;
use serde_json::{Value, json};
use tokio::sync::watch;

struct Rig {
    engine: Engine,
    transport: ScriptedTransport,
    clock: FakeClock,
}

fn config() -> EngineConfig {
    EngineConfig {
        background_sync: false,
        tick_interval: Duration::from_secs(3600),
        ..EngineConfig::default()
    }
}

fn rig_on(store: Arc<dyn KvStore>, clock: FakeClock) -> Rig {
    let transport = ScriptedTransport::new();
    let engine = Engine::new(
        config(),
        store,
        Arc::new(transport.clone()),
        Arc::new(clock.clone()),
    );
    Rig {
        engine,
        transport,
        clock,
    }
}

async fn ready(store: Arc<dyn KvStore>, clock: FakeClock) -> Rig {
    let rig = rig_on(store, clock);
    rig.engine.initialize(&[]).await.unwrap();
    rig
}

fn north() -> JobData {
    JobData::for_field("North", 12.5)
}

#[tokio::test]
async fn pause_and_resume_count_only_running_time() {
    let rig = ready(Arc::new(MemoryStore::new()), FakeClock::new()).await;

    rig.engine.start("f1", JobType::Spray, north()).await.unwrap();
    rig.clock.advance(Duration::from_secs(5));
    assert!(rig.engine.pause("f1").await.unwrap());
    rig.clock.advance(Duration::from_secs(60));
    assert!(rig.engine.resume("f1").await.unwrap());
    rig.clock.advance(Duration::from_secs(3));
    let job = rig.engine.stop("f1").await.unwrap().unwrap();

    assert_eq!(job.record.elapsed_time, 8_000);
    assert_eq!(job.record.timestamps.len(), 4);
    assert_eq!(job.cache.sync_status, SyncStatus::Pending);
    assert!(!rig.engine.has_active("f1").await);
}

#[tokio::test]
async fn one_recording_per_field_and_one_job_per_stop() {
    let rig = ready(Arc::new(MemoryStore::new()), FakeClock::new()).await;
    rig.engine.start("f1", JobType::Sow, north()).await.unwrap();
    assert!(matches!(
        rig.engine.start("f1", JobType::Sow, north()).await,
        Err(EngineError::AlreadyActive { .. })
    ));

    let (a, b) = tokio::join!(rig.engine.stop("f1"), rig.engine.stop("f1"));
    let stopped: Vec<Job> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(rig.engine.get_pending_jobs().await.len(), 1);
    assert_eq!(
        rig.engine
            .get_history("f1", &JobQuery::new())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn three_field_batch_end_to_end() {
    let rig = ready(Arc::new(MemoryStore::new()), FakeClock::new()).await;
    let payloads: Vec<FieldPayload> = ["a", "b", "c"]
        .iter()
        .map(|id| {
            let mut job = JobData::for_field(format!("Field {id}"), 2.0);
            job.tool = Some(Reference::named("t1", "Boom"));
            FieldPayload::new(*id, JobType::Spray, job)
        })
        .collect();

    rig.engine.start_batch(payloads).await.unwrap();
    rig.clock.advance(Duration::from_secs(10));
    rig.engine.advance_batch("b").await.unwrap();
    rig.clock.advance(Duration::from_secs(20));
    rig.engine.advance_batch("c").await.unwrap();
    assert!(!rig.engine.is_batch_active().await);
    rig.clock.advance(Duration::from_secs(30));
    rig.engine.complete_batch().await.unwrap();

    let jobs = rig
        .engine
        .get_by_type(JobType::Spray, &JobQuery::new())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 3);
    let total: u64 = jobs.iter().map(|j| j.record.elapsed_time).sum();
    assert_eq!(total, 60_000);
    assert!(jobs.iter().all(|j| j.record.tool.is_some()));
    assert!(rig.engine.get_all_active().await.is_empty());
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let rig = ready(Arc::new(MemoryStore::new()), FakeClock::new()).await;
    rig.engine.start("f1", JobType::Harvest, north()).await.unwrap();
    let job = rig.engine.stop("f1").await.unwrap().unwrap();
    for _ in 0..3 {
        rig.transport.push_status(500, Value::Null);
    }
    rig.transport
        .push_status(200, json!({"_id": "server-42"}));

    for _ in 0..3 {
        let report = rig.engine.drain().await;
        assert_eq!(report.failed, 1);
        rig.clock.advance(Duration::from_secs(600));
    }
    let report = rig.engine.drain().await;
    assert_eq!(report.synced, 1);

    let cached = &rig
        .engine
        .get_history("f1", &JobQuery::new())
        .await
        .unwrap()[0];
    assert_eq!(cached.id(), job.id());
    assert_eq!(cached.cache.server_job_id.as_deref(), Some("server-42"));
    assert!(rig.engine.get_pending_jobs().await.is_empty());
    assert_eq!(rig.transport.post_count(), 4);
}

#[tokio::test]
async fn conflict_marks_job_synced() {
    let rig = ready(Arc::new(MemoryStore::new()), FakeClock::new()).await;
    let mut rx = rig.engine.subscribe();
    rig.engine.start("f1", JobType::Spray, north()).await.unwrap();
    let job = rig.engine.stop("f1").await.unwrap().unwrap();
    rig.transport.push_status(409, Value::Null);

    rig.engine.drain().await;

    let mut synced = None;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::JobSynced { job_id, status, .. } = event {
            synced = Some((job_id, status));
        }
    }
    assert_eq!(synced, Some((job.id().to_string(), SyncStatus::Synced)));
}

#[tokio::test]
async fn crash_after_staging_recovers_one_job() {
    let store = MemoryStore::new();
    let clock = FakeClock::new();

    let rec = Recording::start("f1", JobType::Spray, north(), 1_704_067_200_000);
    write_json(&store, keys::ACTIVE_RECORDINGS, &vec![rec.clone()])
        .await
        .unwrap();
    let mut done = rec;
    done.complete(1_704_067_206_000);
    let job = Job::from_recording(done, 1_704_067_206_000, 86_400_000);
    StagingLog::<Job>::new(keys::COMPLETION_STAGING)
        .append(&store, job.id(), &job, 0)
        .await
        .unwrap();

    let rig = ready(Arc::new(store.clone()), clock).await;

    assert!(rig.engine.get_all_active().await.is_empty());
    let pending = rig.engine.get_pending_jobs().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job.id(), job.id());
    let history = rig
        .engine
        .get_all_cached_jobs(&JobQuery::new())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(store.get(keys::COMPLETION_STAGING).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_state_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("fieldlog.db");
    let clock = FakeClock::new();

    {
        let store = SqliteStore::open(&path).unwrap();
        let rig = ready(Arc::new(store), clock.clone()).await;
        rig.engine.start("f1", JobType::Spray, north()).await.unwrap();
        rig.engine.start("f2", JobType::Irrigate, north()).await.unwrap();
        rig.clock.advance(Duration::from_secs(4));
        rig.engine.stop("f2").await.unwrap();
        rig.engine.cleanup().await.unwrap();
    }

    clock.advance(Duration::from_secs(6));
    let store = SqliteStore::open(&path).unwrap();
    let rig = ready(Arc::new(store), clock).await;

    let active = rig.engine.get_active("f1").await.unwrap();
    assert_eq!(active.elapsed_time, 10_000);
    let pending = rig.engine.get_pending_jobs().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job.field_id(), "f2");
    let stats = rig.engine.get_stats().await;
    assert_eq!(stats.cached_jobs, 1);
    assert_eq!(stats.active_recordings, 1);
}

#[tokio::test]
async fn reconnecting_wakes_the_drain() {
    let rig = ready(Arc::new(MemoryStore::new()), FakeClock::new()).await;
    rig.engine.start("f1", JobType::Spray, north()).await.unwrap();
    rig.engine.stop("f1").await.unwrap();

    let (net_tx, net_rx) = watch::channel(NetworkState::Offline);
    let (_app_tx, app_rx) = watch::channel(AppState::Foreground);
    rig.engine.attach_connectivity(net_rx, app_rx);
    assert_eq!(rig.transport.post_count(), 0);

    net_tx.send(NetworkState::Online).unwrap();
    for _ in 0..100 {
        if rig.engine.get_pending_jobs().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(rig.engine.get_pending_jobs().await.is_empty());
    assert_eq!(rig.transport.post_count(), 1);
}
