// ABOUTME: Engine tuning knobs with defaults and FIELDLOG_* environment overrides.
// ABOUTME: Invalid or out-of-range values are rejected with a ConfigError naming the variable.

use std::str::FromStr;
use std::time::Duration;

use fieldlog_core::BackoffPolicy;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} is not a valid number: {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} is out of range: {reason}")]
    OutOfRange { var: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_concurrent_recordings: usize,
    pub tick_interval: Duration,
    /// Persist the active-recordings blob every this many ticks.
    pub persist_every_ticks: u64,
    /// Cached jobs kept per field before the oldest synced one is evicted.
    pub cache_per_field: usize,
    pub cache_ttl: Duration,
    pub sync_interval: Duration,
    pub backoff: BackoffPolicy,
    pub hydration_interval: Duration,
    /// Cached jobs loaded per store round trip when answering queries.
    pub query_batch_size: usize,
    /// Run the periodic drain and drain after every stop. Tests turn this
    /// off and call `Engine::drain` themselves.
    pub background_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recordings: 10,
            tick_interval: Duration::from_secs(1),
            persist_every_ticks: 5,
            cache_per_field: 50,
            cache_ttl: Duration::from_secs(30 * 24 * 3600),
            sync_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            hydration_interval: Duration::from_secs(5 * 60),
            query_batch_size: 20,
            background_sync: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables (all optional):
    /// - FIELDLOG_MAX_RECORDINGS: concurrent recording limit (default: 10)
    /// - FIELDLOG_TICK_MS: clock tick period (default: 1000)
    /// - FIELDLOG_PERSIST_EVERY_TICKS: active blob persist cadence (default: 5)
    /// - FIELDLOG_CACHE_PER_FIELD: cached jobs per field (default: 50)
    /// - FIELDLOG_CACHE_TTL_HOURS: cached job lifetime (default: 720)
    /// - FIELDLOG_SYNC_INTERVAL_MS: periodic drain period (default: 30000)
    /// - FIELDLOG_BACKOFF_BASE_MS, FIELDLOG_BACKOFF_MULTIPLIER, FIELDLOG_BACKOFF_MAX_MS,
    ///   FIELDLOG_BACKOFF_JITTER, FIELDLOG_MAX_ATTEMPTS: retry policy
    /// - FIELDLOG_HYDRATION_INTERVAL_MS: minimum gap between hydrations (default: 300000)
    /// - FIELDLOG_QUERY_BATCH: cache read batch size (default: 20)
    /// - FIELDLOG_BACKGROUND_SYNC: enable background draining (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lookup = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let tick_ms = env_number(&lookup, "FIELDLOG_TICK_MS", 1_000u64)?;
        let ttl_hours = env_number(&lookup, "FIELDLOG_CACHE_TTL_HOURS", 720u64)?;
        let sync_ms = env_number(&lookup, "FIELDLOG_SYNC_INTERVAL_MS", 30_000u64)?;
        let hydration_ms = env_number(&lookup, "FIELDLOG_HYDRATION_INTERVAL_MS", 300_000u64)?;
        let background_sync = lookup("FIELDLOG_BACKGROUND_SYNC")
            .map(|v| matches!(v.trim(), "true" | "1" | "yes"))
            .unwrap_or(defaults.background_sync);

        let base = defaults.backoff;
        let backoff = BackoffPolicy {
            base_delay_ms: env_number(&lookup, "FIELDLOG_BACKOFF_BASE_MS", base.base_delay_ms)?,
            multiplier: env_number(&lookup, "FIELDLOG_BACKOFF_MULTIPLIER", base.multiplier)?,
            max_delay_ms: env_number(&lookup, "FIELDLOG_BACKOFF_MAX_MS", base.max_delay_ms)?,
            jitter_factor: env_number(&lookup, "FIELDLOG_BACKOFF_JITTER", base.jitter_factor)?,
            max_attempts: env_number(&lookup, "FIELDLOG_MAX_ATTEMPTS", base.max_attempts)?,
        };

        let config = Self {
            max_concurrent_recordings: env_number(
                &lookup,
                "FIELDLOG_MAX_RECORDINGS",
                defaults.max_concurrent_recordings,
            )?,
            tick_interval: Duration::from_millis(tick_ms),
            persist_every_ticks: env_number(
                &lookup,
                "FIELDLOG_PERSIST_EVERY_TICKS",
                defaults.persist_every_ticks,
            )?,
            cache_per_field: env_number(&lookup, "FIELDLOG_CACHE_PER_FIELD", defaults.cache_per_field)?,
            cache_ttl: Duration::from_secs(ttl_hours.saturating_mul(3600)),
            sync_interval: Duration::from_millis(sync_ms),
            backoff,
            hydration_interval: Duration::from_millis(hydration_ms),
            query_batch_size: env_number(&lookup, "FIELDLOG_QUERY_BATCH", defaults.query_batch_size)?,
            background_sync,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_recordings == 0 {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_MAX_RECORDINGS",
                reason: "must be at least 1",
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_TICK_MS",
                reason: "must be positive",
            });
        }
        if self.persist_every_ticks == 0 {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_PERSIST_EVERY_TICKS",
                reason: "must be at least 1",
            });
        }
        if self.cache_per_field == 0 {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_CACHE_PER_FIELD",
                reason: "must be at least 1",
            });
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_SYNC_INTERVAL_MS",
                reason: "must be positive",
            });
        }
        if self.query_batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_QUERY_BATCH",
                reason: "must be at least 1",
            });
        }
        if !(1.0..=10.0).contains(&self.backoff.multiplier) {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_BACKOFF_MULTIPLIER",
                reason: "must be between 1 and 10",
            });
        }
        if !(0.0..1.0).contains(&self.backoff.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_BACKOFF_JITTER",
                reason: "must be in [0, 1)",
            });
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                var: "FIELDLOG_MAX_ATTEMPTS",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    pub(crate) fn cache_ttl_ms(&self) -> u64 {
        self.cache_ttl.as_millis() as u64
    }

    pub(crate) fn hydration_interval_ms(&self) -> u64 {
        self.hydration_interval.as_millis() as u64
    }
}

fn env_number<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}
