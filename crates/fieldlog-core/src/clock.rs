// ABOUTME: Wall-clock abstraction so elapsed-time and retry scheduling can be tested deterministically.
// ABOUTME: SystemClock reads real time; FakeClock is advanced by hand in tests.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn epoch_ms(&self) -> u64;

    /// The current time as a UTC timestamp.
    fn now(&self) -> DateTime<Utc> {
        ms_to_datetime(self.epoch_ms())
    }
}

/// Convert epoch milliseconds into a `DateTime<Utc>`, saturating at the epoch
/// for values chrono cannot represent.
pub fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Fake clock for tests. Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct FakeClock {
    epoch_ms: Arc<Mutex<u64>>,
}

impl FakeClock {
    /// Start at a fixed, recognisable instant (2024-01-01T00:00:00Z).
    pub fn new() -> Self {
        Self::at(1_704_067_200_000)
    }

    pub fn at(epoch_ms: u64) -> Self {
        Self {
            epoch_ms: Arc::new(Mutex::new(epoch_ms)),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        *self.epoch_ms.lock() += duration.as_millis() as u64;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn epoch_ms(&self) -> u64 {
        *self.epoch_ms.lock()
    }
}
