// ABOUTME: The fieldlog engine: times field work, finalizes it crash-safely, caches completed jobs
// ABOUTME: and syncs them to the server exactly once through a durable outbox.

pub mod batch;
pub mod bus;
pub mod cache;
pub mod completion;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod hydrate;
pub mod recording;
pub mod scheduler;
pub mod sync;

pub use bus::{EventBus, ListenerId};
pub use cache::JobQuery;
pub use config::{ConfigError, EngineConfig};
pub use connectivity::{AppState, ConnectivityMonitor, NetworkState, WakeReason};
pub use engine::{Engine, EngineStats};
pub use error::EngineError;
pub use hydrate::HydrateReport;
pub use scheduler::{IntervalHandle, every_interval};
pub use sync::{DrainReport, PendingJob};
