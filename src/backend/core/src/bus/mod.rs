//! At-least-once message bus adapter.
//!
//! One logical queue per [`EventKind`]. A received [`Delivery`] stays in
//! flight until it is acknowledged or handed back with a redelivery delay.
//! Deliveries left in flight by a crash or a failed ack are put back on the
//! queue by [`MessageBus::reclaim_stale`].
//!
//! Backends:
//! - **InMemoryBus**: per-kind queues in process memory, for tests and replay
//! - **RedisBus**: Redis lists with a processing list and a delayed sorted set

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventEnvelope, EventKind};

pub mod memory;
pub mod redis_bus;

pub use memory::InMemoryBus;
pub use redis_bus::{RedisBus, RedisBusConfig};

/// A message as stored on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BusMessage {
    pub id: Uuid,
    pub payload: String,
    /// Deliveries already made
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_received_at: Option<DateTime<Utc>>,
}

impl BusMessage {
    pub fn new(payload: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            attempt: 0,
            first_received_at: None,
        }
    }

    /// Turn a stored message into the next delivery of it.
    pub fn into_delivery(self, kind: EventKind, receipt: Option<String>) -> Delivery {
        Delivery {
            id: self.id,
            kind,
            payload: self.payload,
            attempt: self.attempt + 1,
            first_received_at: self.first_received_at.unwrap_or_else(Utc::now),
            receipt,
        }
    }
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub kind: EventKind,
    /// Raw JSON payload
    pub payload: String,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
    pub first_received_at: DateTime<Utc>,
    /// Backend handle used to acknowledge the in-flight copy
    pub(crate) receipt: Option<String>,
}

impl Delivery {
    /// The message as it should be stored for its next delivery.
    pub(crate) fn to_message(&self) -> BusMessage {
        BusMessage {
            id: self.id,
            payload: self.payload.clone(),
            attempt: self.attempt,
            first_received_at: Some(self.first_received_at),
        }
    }
}

/// Trait for message bus backends.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueue a raw payload on the queue for `kind`.
    async fn publish(&self, kind: EventKind, payload: String) -> Result<()>;

    /// Take the next ready message, if any. Never blocks waiting for one.
    async fn receive(&self, kind: EventKind) -> Result<Option<Delivery>>;

    /// Confirm a delivery was handled; it will not be delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Hand a delivery back to be delivered again after `delay`.
    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<()>;

    /// Put back every delivery of `kind` received more than `older_than`
    /// ago and never settled. Returns how many were put back.
    async fn reclaim_stale(&self, kind: EventKind, older_than: Duration) -> Result<usize>;

    /// Messages waiting on the queue for `kind`, ready or delayed.
    async fn pending(&self, kind: EventKind) -> Result<usize>;

    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Serialize and enqueue an envelope on its kind's queue.
    async fn publish_event(&self, envelope: &EventEnvelope) -> Result<()> {
        self.publish(envelope.kind(), envelope.to_json()?).await
    }
}
