//! Projection store abstraction.
//!
//! The store exposes exactly one mutating primitive, [`ProjectionStore::commit`],
//! which applies a [`Transaction`] atomically when all of its preconditions
//! hold. Reads are unconditional. Because there is no other write path,
//! concurrent consumer replicas are safe without external locks.
//!
//! Backends:
//! - **InMemoryStore**: single-process keyspace for tests and dry-run replay
//! - **RedisStore**: each transaction runs as one Lua script

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::error::Result;

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod transaction;

pub use keys::{Counter, KeyBuilder};
pub use memory::InMemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use transaction::{CommitOutcome, Operation, Precondition, Transaction};

/// Trait for projection store backends.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Atomically apply `tx` if every precondition holds.
    async fn commit(&self, tx: Transaction) -> Result<CommitOutcome>;

    /// Read a string key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Check whether a key exists (of any type).
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read one hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Read a whole hash; a missing key reads as empty.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Check set membership; a missing key reads as empty.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// Read every member of a set; a missing key reads as empty.
    async fn set_members(&self, key: &str) -> Result<HashSet<String>>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}
