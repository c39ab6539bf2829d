// ABOUTME: Write-ahead staging log for multi-step operations that must survive a crash mid-way.
// ABOUTME: Append before mutating, commit (delete) after the last step; leftovers are replayed on startup.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::kv::{KvStore, StoreError, read_list, write_json};

/// One in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntry<T> {
    pub id: String,
    pub payload: T,
    /// Epoch milliseconds at which the entry was staged.
    pub timestamp: u64,
}

/// A durable list of staged entries stored under one key.
///
/// Usage: `append` the payload before the first side effect, run every step,
/// then `commit`. After a crash, `entries` returns whatever was staged but not
/// committed; each step must therefore be safe to repeat.
#[derive(Debug, Clone)]
pub struct StagingLog<T> {
    key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> StagingLog<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            _payload: PhantomData,
        }
    }

    /// Every uncommitted entry, oldest first. Corrupt entries are skipped.
    pub async fn entries(&self, store: &dyn KvStore) -> Result<Vec<StagedEntry<T>>, StoreError> {
        read_list(store, &self.key).await
    }

    /// Stage `payload` under `id`, replacing any earlier entry with that id.
    pub async fn append(
        &self,
        store: &dyn KvStore,
        id: &str,
        payload: &T,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let mut entries = self.raw_entries(store).await?;
        entries.retain(|e| entry_id(e) != Some(id));
        entries.push(serde_json::to_value(StagedEntryRef {
            id,
            payload,
            timestamp,
        })?);
        write_json(store, &self.key, &entries).await
    }

    /// Remove the entry for `id`. Returns false if it was not staged.
    pub async fn commit(&self, store: &dyn KvStore, id: &str) -> Result<bool, StoreError> {
        let mut entries = self.raw_entries(store).await?;
        let before = entries.len();
        entries.retain(|e| entry_id(e) != Some(id));
        if entries.len() == before {
            return Ok(false);
        }
        if entries.is_empty() {
            store.remove(&self.key).await?;
        } else {
            write_json(store, &self.key, &entries).await?;
        }
        Ok(true)
    }

    async fn raw_entries(&self, store: &dyn KvStore) -> Result<Vec<serde_json::Value>, StoreError> {
        read_list(store, &self.key).await
    }
}

#[derive(Serialize)]
struct StagedEntryRef<'a, T> {
    id: &'a str,
    payload: &'a T,
    timestamp: u64,
}

fn entry_id(value: &serde_json::Value) -> Option<&str> {
    value.get("id").and_then(serde_json::Value::as_str)
}
