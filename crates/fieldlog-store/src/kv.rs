// ABOUTME: The async key-value store abstraction the engine persists through.
// ABOUTME: JSON helpers treat unparseable entries as absent and log them instead of failing.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A durable string-to-string map. Implementations must make each single-key
/// write durable before returning.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Fetch several keys at once. The result has one entry per requested key,
    /// in request order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key).await?));
        }
        Ok(out)
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

/// Read and deserialize a JSON value. Missing keys and corrupt values both
/// yield `None`; corruption is logged.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "ignoring corrupt persisted value");
            Ok(None)
        }
    }
}

/// Read a JSON array, keeping every element that parses and skipping the rest.
pub async fn read_list<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Vec<T>, StoreError> {
    let Some(items) = read_json::<Vec<serde_json::Value>>(store, key).await? else {
        return Ok(Vec::new());
    };
    let total = items.len();
    let parsed: Vec<T> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if parsed.len() < total {
        tracing::warn!(
            key,
            skipped = total - parsed.len(),
            "skipped corrupt list entries"
        );
    }
    Ok(parsed)
}

/// Serialize a value as JSON and store it.
pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)?;
    store.set(key, &json).await
}
