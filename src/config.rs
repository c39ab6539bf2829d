// ABOUTME: Configuration for the fieldlog binary, layered on top of the engine's own settings.
// ABOUTME: Reads FIELDLOG_HOME and FIELDLOG_API_URL plus every FIELDLOG_* engine variable.

use std::path::PathBuf;

use fieldlog_engine::{ConfigError, EngineConfig};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";
const DB_FILE: &str = "fieldlog.db";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub home: PathBuf,
    pub api_url: String,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Environment variables:
    /// - FIELDLOG_HOME: data directory (default: ~/.fieldlog)
    /// - FIELDLOG_API_URL: job API base URL (default: http://127.0.0.1:3000)
    /// - FIELDLOG_*: engine settings, see `EngineConfig::from_env`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let home = set("FIELDLOG_HOME").map(PathBuf::from).unwrap_or_else(|| {
            set("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".fieldlog")
        });
        let api_url = set("FIELDLOG_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Ok(Self {
            home,
            api_url,
            engine: EngineConfig::from_lookup(&lookup)?,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join(DB_FILE)
    }
}
