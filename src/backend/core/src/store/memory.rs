//! In-memory projection store.
//!
//! Mirrors the Redis data model closely enough for the consumers not to
//! notice the difference: empty hashes and sets disappear, `HSET` keeps an
//! existing expiry, a string `SET` clears it, and expired keys read as absent.
//! Time comes from `tokio::time::Instant`, so tests can pause and advance
//! the clock to exercise grace expiries.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::transaction::{CommitOutcome, Operation, Precondition, Transaction};
use super::ProjectionStore;
use crate::error::{Result, TallyError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::Set(s) => s.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    /// Drop `key` if its expiry has passed.
    fn purge(&mut self, key: &str, now: Instant) {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            trace!(key, "Expired key purged");
            self.slots.remove(key);
        }
    }

    fn hash(&self, key: &str) -> Result<Option<&HashMap<String, String>>> {
        match self.slots.get(key).map(|s| &s.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(TallyError::wrong_type(key, "hash")),
        }
    }

    fn set(&self, key: &str) -> Result<Option<&HashSet<String>>> {
        match self.slots.get(key).map(|s| &s.value) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(_) => Err(TallyError::wrong_type(key, "set")),
        }
    }

    fn check(&self, precondition: &Precondition) -> Result<bool> {
        Ok(match precondition {
            Precondition::KeyExists { key } => self.slots.contains_key(key),
            Precondition::KeyAbsent { key } => !self.slots.contains_key(key),
            Precondition::HashFieldEquals { key, field, value } => self
                .hash(key)?
                .and_then(|h| h.get(field))
                .is_some_and(|v| v == value),
            Precondition::HashFieldAbsent { key, field } => {
                !self.hash(key)?.is_some_and(|h| h.contains_key(field))
            }
            Precondition::SetContains { key, member } => {
                self.set(key)?.is_some_and(|s| s.contains(member))
            }
            Precondition::SetNotContains { key, member } => {
                !self.set(key)?.is_some_and(|s| s.contains(member))
            }
        })
    }

    /// Reject operations that would fail half-way through.
    fn validate(&self, op: &Operation) -> Result<()> {
        match op {
            Operation::HashIncrement { key, field, .. } => {
                if let Some(current) = self.hash(key)?.and_then(|h| h.get(field)) {
                    current
                        .parse::<i64>()
                        .map_err(|_| TallyError::corrupt_projection(key.clone(), current.clone()))?;
                }
                Ok(())
            }
            Operation::HashSet { key, .. } | Operation::HashDelete { key, .. } => {
                self.hash(key).map(|_| ())
            }
            Operation::SetAdd { key, .. } | Operation::SetRemove { key, .. } => {
                self.set(key).map(|_| ())
            }
            Operation::StringSet { .. }
            | Operation::Expire { .. }
            | Operation::InheritExpiry { .. } => Ok(()),
        }
    }

    fn hash_mut(&mut self, key: &str) -> &mut HashMap<String, String> {
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(h) => h,
            // validate() ran first
            other => unreachable!("hash op on {}", other.type_name()),
        }
    }

    fn set_mut(&mut self, key: &str) -> &mut HashSet<String> {
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Set(s) => s,
            other => unreachable!("set op on {}", other.type_name()),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|s| s.value.is_empty()) {
            self.slots.remove(key);
        }
    }

    fn apply(&mut self, op: Operation, now: Instant) {
        match op {
            Operation::HashIncrement { key, field, delta } => {
                let hash = self.hash_mut(&key);
                let current = hash.get(&field).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
                hash.insert(field, (current + delta).to_string());
            }
            Operation::HashSet { key, field, value } => {
                self.hash_mut(&key).insert(field, value);
            }
            Operation::HashDelete { key, field } => {
                if self.slots.contains_key(&key) {
                    self.hash_mut(&key).remove(&field);
                    self.drop_if_empty(&key);
                }
            }
            Operation::SetAdd { key, member } => {
                self.set_mut(&key).insert(member);
            }
            Operation::SetRemove { key, member } => {
                if self.slots.contains_key(&key) {
                    self.set_mut(&key).remove(&member);
                    self.drop_if_empty(&key);
                }
            }
            Operation::StringSet { key, value } => {
                self.slots.insert(
                    key,
                    Slot {
                        value: Value::Str(value),
                        expires_at: None,
                    },
                );
            }
            Operation::Expire { key, seconds } => {
                if let Some(slot) = self.slots.get_mut(&key) {
                    slot.expires_at = Some(now + Duration::from_secs(seconds));
                }
            }
            Operation::InheritExpiry { key, source } => {
                let inherited = self.slots.get(&source).and_then(|slot| slot.expires_at);
                if let (Some(at), Some(slot)) = (inherited, self.slots.get_mut(&key)) {
                    slot.expires_at = Some(at);
                }
            }
        }
    }
}

/// Single-process projection store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let keyspace = self.keyspace.lock();
        keyspace
            .slots
            .values()
            .filter(|slot| slot.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace.purge(key, now);
        keyspace
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(&Keyspace) -> Result<T>) -> Result<T> {
        let mut keyspace = self.keyspace.lock();
        keyspace.purge(key, Instant::now());
        f(&keyspace)
    }
}

#[async_trait]
impl ProjectionStore for InMemoryStore {
    async fn commit(&self, tx: Transaction) -> Result<CommitOutcome> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();

        for key in tx.keys() {
            keyspace.purge(key, now);
        }

        for precondition in &tx.preconditions {
            if !keyspace.check(precondition)? {
                trace!(?precondition, "Precondition failed");
                return Ok(CommitOutcome::PreconditionFailed);
            }
        }

        for op in &tx.ops {
            keyspace.validate(op)?;
        }

        for op in tx.ops {
            keyspace.apply(op, now);
        }

        Ok(CommitOutcome::Committed)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read(key, |ks| match ks.slots.get(key).map(|s| &s.value) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(TallyError::wrong_type(key, "string")),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.read(key, |ks| Ok(ks.slots.contains_key(key)))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.read(key, |ks| Ok(ks.hash(key)?.and_then(|h| h.get(field).cloned())))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.read(key, |ks| Ok(ks.hash(key)?.cloned().unwrap_or_default()))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.read(key, |ks| Ok(ks.set(key)?.is_some_and(|s| s.contains(member))))
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>> {
        self.read(key, |ks| Ok(ks.set(key)?.cloned().unwrap_or_default()))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_commit_applies_all_operations() {
        let store = InMemoryStore::new();
        let tx = Transaction::new()
            .set("exists", "1")
            .hincr("counts", "OPEN", 1)
            .hset("versions", "i1", "v1")
            .sadd("members", "alice");

        assert_eq!(store.commit(tx).await.unwrap(), CommitOutcome::Committed);
        assert_eq!(store.get("exists").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hash_get("counts", "OPEN").await.unwrap().as_deref(), Some("1"));
        assert!(store.set_contains("members", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_precondition_writes_nothing() {
        let store = InMemoryStore::new();
        let tx = Transaction::new()
            .require_exists("missing")
            .hincr("counts", "OPEN", 1);

        assert_eq!(store.commit(tx).await.unwrap(), CommitOutcome::PreconditionFailed);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_hash_field_preconditions() {
        let store = InMemoryStore::new();
        store
            .commit(Transaction::new().hset("v", "i1", "a"))
            .await
            .unwrap();

        let eq = Transaction::new().require_field_eq("v", "i1", "a").hset("v", "i1", "b");
        assert!(store.commit(eq.clone()).await.unwrap().is_committed());
        // same check again now sees "b"
        assert!(!store.commit(eq).await.unwrap().is_committed());

        let absent = Transaction::new().require_field_absent("v", "i2").hset("v", "i2", "x");
        assert!(store.commit(absent.clone()).await.unwrap().is_committed());
        assert!(!store.commit(absent).await.unwrap().is_committed());
    }

    #[tokio::test]
    async fn test_set_membership_preconditions() {
        let store = InMemoryStore::new();
        let add = Transaction::new().require_not_member("m", "bob").sadd("m", "bob");
        let remove = Transaction::new().require_member("m", "bob").srem("m", "bob");

        assert!(store.commit(add.clone()).await.unwrap().is_committed());
        assert!(!store.commit(add).await.unwrap().is_committed());
        assert!(store.commit(remove.clone()).await.unwrap().is_committed());
        assert!(!store.commit(remove).await.unwrap().is_committed());
        // emptied set disappears like in Redis
        assert!(!store.exists("m").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected_before_any_write() {
        let store = InMemoryStore::new();
        store.commit(Transaction::new().set("s", "x")).await.unwrap();

        let tx = Transaction::new().hincr("counts", "OPEN", 1).hset("s", "f", "v");
        let err = store.commit(tx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreWrongType);
        assert!(!store.exists("counts").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_removes_key_after_ttl() {
        let store = InMemoryStore::new();
        store
            .commit(
                Transaction::new()
                    .hset("h", "f", "v")
                    .expire("h", Duration::from_secs(30)),
            )
            .await
            .unwrap();

        assert!(store.ttl("h").is_some());
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.exists("h").await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inherit_expiry_follows_the_source_key() {
        let store = InMemoryStore::new();
        store
            .commit(Transaction::new().set("owner", "1").expire("owner", Duration::from_secs(30)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        store
            .commit(
                Transaction::new()
                    .sadd("late", "x")
                    .inherit_expiry("late", "owner")
                    .sadd("free", "y")
                    .inherit_expiry("free", "missing"),
            )
            .await
            .unwrap();

        assert_eq!(store.ttl("late"), Some(Duration::from_secs(20)));
        assert!(store.ttl("free").is_none());
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(!store.exists("late").await.unwrap());
        assert!(store.exists("free").await.unwrap());
    }

    #[tokio::test]
    async fn test_string_set_clears_expiry() {
        let store = InMemoryStore::new();
        store
            .commit(Transaction::new().set("k", "a").expire("k", Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store.ttl("k").is_some());

        store.commit(Transaction::new().set("k", "b")).await.unwrap();
        assert!(store.ttl("k").is_none());
    }
}
