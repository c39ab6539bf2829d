// ABOUTME: Core library for fieldlog, containing the job-recording domain model.
// ABOUTME: Defines recordings, jobs, batches, engine events, the job index, backoff and clocks.

pub mod backoff;
pub mod batch;
pub mod clock;
pub mod event;
pub mod index;
pub mod job;

pub use backoff::{BackoffPolicy, RetryMeta};
pub use batch::{BatchState, BatchStatus, FieldPayload, PendingField};
pub use clock::{Clock, FakeClock, SystemClock};
pub use event::{ChangeEvent, EngineEvent};
pub use index::JobIndex;
pub use job::{
    BatchRef, CacheMeta, Job, JobData, JobType, Recording, RecordingStatus, Reference,
    SyncStatus, TimestampAction, TimestampEntry,
};
