//! Terminal destination for deliveries that will not be retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};
use uuid::Uuid;

use crate::consumers::ConsumeError;
use crate::error::{ErrorCode, Result};
use crate::events::EventKind;

/// A delivery that was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// Queue the payload came from
    pub kind: EventKind,
    /// Raw payload, exactly as received
    pub payload: String,
    /// Delivery attempts made
    pub attempts: u32,
    /// Short failure class, e.g. `business_rule`
    pub reason: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub first_received_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        kind: EventKind,
        payload: impl Into<String>,
        attempts: u32,
        first_received_at: DateTime<Utc>,
        error: &ConsumeError,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload: payload.into(),
            attempts,
            reason: error.reason().to_string(),
            error_code: error.error_code(),
            message: error.to_string(),
            first_received_at,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Storage for dead-lettered deliveries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record an entry.
    async fn push(&self, entry: DeadLetterEntry) -> Result<()>;

    /// Oldest entries first, at most `limit`.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Remove and return an entry, e.g. to requeue it.
    async fn take(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded in-process sink; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct InMemoryDeadLetters {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    max_size: usize,
}

impl InMemoryDeadLetters {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
        }
    }

    pub fn snapshot(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for InMemoryDeadLetters {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            if let Some(dropped) = entries.pop_front() {
                warn!(id = %dropped.id, kind = %dropped.kind, "Dead letter sink full, dropping oldest entry");
            }
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.entries.lock().iter().take(limit).cloned().collect())
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let mut entries = self.entries.lock();
        Ok(entries
            .iter()
            .position(|e| e.id == id)
            .and_then(|index| entries.remove(index)))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink backed by a capped Redis list of JSON entries.
#[derive(Clone)]
pub struct RedisDeadLetters {
    conn: ConnectionManager,
    key: String,
    max_size: usize,
}

impl RedisDeadLetters {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, max_size: usize) -> Self {
        Self {
            conn,
            key: key.into(),
            max_size: max_size.max(1),
        }
    }

    async fn all(&self) -> Result<Vec<(String, DeadLetterEntry)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&self.key, 0, -1).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<DeadLetterEntry>(&item) {
                Ok(entry) => entries.push((item, entry)),
                Err(e) => warn!(key = %self.key, error = %e, "Skipping unreadable dead letter"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetters {
    async fn push(&self, entry: DeadLetterEntry) -> Result<()> {
        let json = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let start = -(self.max_size as isize);
        redis::pipe()
            .atomic()
            .rpush(&self.key, json)
            .ignore()
            .ltrim(&self.key, start, -1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        info!(id = %entry.id, kind = %entry.kind, reason = %entry.reason, "Dead letter recorded");
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry)
            .collect())
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let Some((raw, entry)) = self.all().await?.into_iter().find(|(_, e)| e.id == id) else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(&self.key, 1, raw).await?;
        // a concurrent take won the race
        Ok((removed == 1).then_some(entry))
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(reason: &str) -> DeadLetterEntry {
        DeadLetterEntry::new(
            EventKind::AssignmentCreated,
            "{}",
            1,
            Utc::now(),
            &ConsumeError::membership(reason),
        )
    }

    #[test]
    fn test_entry_records_error_classification() {
        let entry = entry("alice is already a member of project p1");
        assert_eq!(entry.reason, "business_rule");
        assert_eq!(entry.error_code, ErrorCode::MembershipViolation);
        assert!(entry.message.contains("alice"));
    }

    #[tokio::test]
    async fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryDeadLetters::new(2);
        let first = entry("a");
        let first_id = first.id;
        sink.push(first).await.unwrap();
        sink.push(entry("b")).await.unwrap();
        sink.push(entry("c")).await.unwrap();

        assert_eq!(sink.len().await.unwrap(), 2);
        assert!(sink.take(first_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_take_removes_entry() {
        let sink = InMemoryDeadLetters::default();
        let e = entry("a");
        let id = e.id;
        sink.push(e).await.unwrap();

        assert_eq!(sink.take(id).await.unwrap().map(|e| e.id), Some(id));
        assert!(sink.is_empty().await.unwrap());
    }
}
