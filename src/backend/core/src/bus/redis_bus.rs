//! Redis message bus.
//!
//! Per event kind, four keys sharing one hash tag:
//! - `<prefix>{<kind>}`: ready list, consumed from the left
//! - `<prefix>{<kind>}:processing`: in-flight copies, removed on ack
//! - `<prefix>{<kind>}:leases`: in-flight copies scored by receipt time (ms)
//! - `<prefix>{<kind>}:delayed`: sorted set of retries scored by due time (ms)
//!
//! `receive` promotes due retries, takes the next message and records its
//! lease in one script.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::{BusMessage, Delivery, MessageBus};
use crate::error::{ErrorCode, Result, TallyError};
use crate::events::EventKind;

// KEYS: delayed, ready, processing, leases. ARGV: now (ms), promote batch.
const RECEIVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, item in ipairs(due) do
    redis.call('ZREM', KEYS[1], item)
    redis.call('RPUSH', KEYS[2], item)
end
local raw = redis.call('LMOVE', KEYS[2], KEYS[3], 'LEFT', 'RIGHT')
if raw then
    redis.call('ZADD', KEYS[4], ARGV[1], raw)
end
return raw
"#;

// KEYS: leases, processing, ready. ARGV: cutoff (ms).
const RECLAIM_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local reclaimed = 0
for _, raw in ipairs(stale) do
    redis.call('ZREM', KEYS[1], raw)
    if redis.call('LREM', KEYS[2], 1, raw) > 0 then
        redis.call('RPUSH', KEYS[3], raw)
        reclaimed = reclaimed + 1
    end
end
return reclaimed
"#;

/// Redis bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisBusConfig {
    /// Prefix of every bus key
    pub key_prefix: String,

    /// Most delayed messages promoted per receive
    pub promote_batch: usize,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tally:bus:".to_string(),
            promote_batch: 100,
        }
    }
}

/// Message bus backed by Redis lists.
#[derive(Clone)]
pub struct RedisBus {
    conn: ConnectionManager,
    config: RedisBusConfig,
    receive_script: redis::Script,
    reclaim_script: redis::Script,
}

impl RedisBus {
    pub fn new(conn: ConnectionManager, config: RedisBusConfig) -> Self {
        Self {
            conn,
            config,
            receive_script: redis::Script::new(RECEIVE_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
        }
    }

    fn ready_key(&self, kind: EventKind) -> String {
        format!("{}{{{}}}", self.config.key_prefix, kind)
    }

    fn processing_key(&self, kind: EventKind) -> String {
        format!("{}{{{}}}:processing", self.config.key_prefix, kind)
    }

    fn leases_key(&self, kind: EventKind) -> String {
        format!("{}{{{}}}:leases", self.config.key_prefix, kind)
    }

    fn delayed_key(&self, kind: EventKind) -> String {
        format!("{}{{{}}}:delayed", self.config.key_prefix, kind)
    }

    fn receipt<'a>(&self, delivery: &'a Delivery) -> Result<&'a str> {
        delivery.receipt.as_deref().ok_or_else(|| {
            TallyError::new(
                ErrorCode::BusError,
                "Delivery was not received from the Redis bus",
            )
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, kind: EventKind, payload: String) -> Result<()> {
        let json = serde_json::to_string(&BusMessage::new(payload))?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.ready_key(kind), json).await?;
        Ok(())
    }

    async fn receive(&self, kind: EventKind) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .receive_script
            .key(self.delayed_key(kind))
            .key(self.ready_key(kind))
            .key(self.processing_key(kind))
            .key(self.leases_key(kind))
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.promote_batch)
            .invoke_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<BusMessage>(&raw) {
            Ok(message) => Ok(Some(message.into_delivery(kind, Some(raw)))),
            Err(e) => {
                // Not written by this bus; hand it to the consumer so it
                // is dead-lettered as malformed.
                warn!(kind = %kind, error = %e, "Foreign message on bus queue");
                Ok(Some(BusMessage::new(raw.clone()).into_delivery(kind, Some(raw))))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let receipt = self.receipt(delivery)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(delivery.kind), 1, receipt)
            .ignore()
            .zrem(self.leases_key(delivery.kind), receipt)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        let receipt = self.receipt(&delivery)?;
        let json = serde_json::to_string(&delivery.to_message())?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(delivery.kind), 1, receipt)
            .ignore()
            .zrem(self.leases_key(delivery.kind), receipt)
            .ignore()
            .zadd(self.delayed_key(delivery.kind), json, due)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reclaim_stale(&self, kind: EventKind, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let mut conn = self.conn.clone();
        let reclaimed: usize = self
            .reclaim_script
            .key(self.leases_key(kind))
            .key(self.processing_key(kind))
            .key(self.ready_key(kind))
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        if reclaimed > 0 {
            warn!(kind = %kind, reclaimed, "Reclaimed deliveries left in flight");
        }
        Ok(reclaimed)
    }

    async fn pending(&self, kind: EventKind) -> Result<usize> {
        let mut conn = self.conn.clone();
        let (ready, delayed): (usize, usize) = redis::pipe()
            .llen(self.ready_key(kind))
            .zcard(self.delayed_key(kind))
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
