// ABOUTME: Persistence layer for fieldlog, handling durable key-value storage of engine state.
// ABOUTME: Provides the KvStore trait, SQLite and in-memory backends, JSON helpers and the staging log.

pub mod keys;
pub mod kv;
pub mod memory;
pub mod sqlite;
pub mod staging;

pub use kv::{KvStore, StoreError, read_json, read_list, write_json};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use staging::{StagedEntry, StagingLog};
