//! In-process message bus.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use super::{BusMessage, Delivery, MessageBus};
use crate::error::Result;
use crate::events::EventKind;

#[derive(Debug, Default)]
struct KindQueue {
    ready: VecDeque<BusMessage>,
    delayed: Vec<(Instant, BusMessage)>,
    /// Receipt time and message of every unsettled delivery
    in_flight: HashMap<Uuid, (Instant, BusMessage)>,
}

impl KindQueue {
    /// Move every delayed message whose time has come to the ready queue.
    fn promote(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let due = self.delayed.partition_point(|(at, _)| *at <= now);
        for (_, message) in self.delayed.drain(..due) {
            self.ready.push_back(message);
        }
    }
}

/// Message bus held in process memory. Delays follow the tokio clock.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    queues: DashMap<EventKind, KindQueue>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries currently in flight for `kind`.
    pub fn in_flight(&self, kind: EventKind) -> usize {
        self.queues.get(&kind).map_or(0, |q| q.in_flight.len())
    }

    /// Time until the earliest delayed message for `kind` is due.
    pub fn next_due(&self, kind: EventKind) -> Option<Duration> {
        let now = Instant::now();
        self.queues.get(&kind).and_then(|q| {
            q.delayed
                .iter()
                .map(|(due, _)| due.saturating_duration_since(now))
                .min()
        })
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, kind: EventKind, payload: String) -> Result<()> {
        self.queues
            .entry(kind)
            .or_default()
            .ready
            .push_back(BusMessage::new(payload));
        Ok(())
    }

    async fn receive(&self, kind: EventKind) -> Result<Option<Delivery>> {
        let mut queue = self.queues.entry(kind).or_default();
        queue.promote(Instant::now());
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.in_flight.insert(message.id, (Instant::now(), message.clone()));
        Ok(Some(message.into_delivery(kind, None)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if let Some(mut queue) = self.queues.get_mut(&delivery.kind) {
            queue.in_flight.remove(&delivery.id);
        }
        Ok(())
    }

    async fn redeliver(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        let mut queue = self.queues.entry(delivery.kind).or_default();
        queue.in_flight.remove(&delivery.id);
        trace!(id = %delivery.id, attempt = delivery.attempt, ?delay, "Redelivery scheduled");
        let due = Instant::now() + delay;
        queue.delayed.push((due, delivery.to_message()));
        Ok(())
    }

    async fn reclaim_stale(&self, kind: EventKind, older_than: Duration) -> Result<usize> {
        let Some(mut queue) = self.queues.get_mut(&kind) else {
            return Ok(0);
        };
        let now = Instant::now();
        let stale: Vec<Uuid> = queue
            .in_flight
            .iter()
            .filter(|(_, (received, _))| *received + older_than <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some((_, message)) = queue.in_flight.remove(id) {
                queue.ready.push_back(message);
            }
        }
        if !stale.is_empty() {
            trace!(kind = %kind, reclaimed = stale.len(), "Stale deliveries reclaimed");
        }
        Ok(stale.len())
    }

    async fn pending(&self, kind: EventKind) -> Result<usize> {
        Ok(self
            .queues
            .get(&kind)
            .map_or(0, |q| q.ready.len() + q.delayed.len()))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_per_kind() {
        let bus = InMemoryBus::new();
        bus.publish(EventKind::IssueCreated, "a".into()).await.unwrap();
        bus.publish(EventKind::IssueCreated, "b".into()).await.unwrap();
        bus.publish(EventKind::UserCreated, "u".into()).await.unwrap();

        let first = bus.receive(EventKind::IssueCreated).await.unwrap().unwrap();
        assert_eq!(first.payload, "a");
        assert_eq!(first.attempt, 1);
        assert_eq!(bus.in_flight(EventKind::IssueCreated), 1);

        bus.ack(&first).await.unwrap();
        assert_eq!(bus.in_flight(EventKind::IssueCreated), 0);
        assert_eq!(bus.pending(EventKind::IssueCreated).await.unwrap(), 1);
        assert_eq!(bus.pending(EventKind::UserCreated).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_receive_on_empty_queue() {
        let bus = InMemoryBus::new();
        assert!(bus.receive(EventKind::ProjectDeleted).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_delivery_is_reclaimed_after_lease() {
        let bus = InMemoryBus::new();
        bus.publish(EventKind::IssueCreated, "a".into()).await.unwrap();
        let delivery = bus.receive(EventKind::IssueCreated).await.unwrap().unwrap();

        let lease = Duration::from_secs(30);
        assert_eq!(bus.reclaim_stale(EventKind::IssueCreated, lease).await.unwrap(), 0);
        tokio::time::advance(lease).await;
        assert_eq!(bus.reclaim_stale(EventKind::IssueCreated, lease).await.unwrap(), 1);
        assert_eq!(bus.in_flight(EventKind::IssueCreated), 0);

        let again = bus.receive(EventKind::IssueCreated).await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
        assert_eq!(again.payload, "a");
        // the original handler finishing late still settles the message
        bus.ack(&delivery).await.unwrap();
        assert_eq!(bus.in_flight(EventKind::IssueCreated), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_waits_for_delay() {
        let bus = InMemoryBus::new();
        bus.publish(EventKind::IssueUpdated, "x".into()).await.unwrap();
        let delivery = bus.receive(EventKind::IssueUpdated).await.unwrap().unwrap();
        let first_seen = delivery.first_received_at;

        bus.redeliver(delivery, Duration::from_secs(5)).await.unwrap();
        assert!(bus.receive(EventKind::IssueUpdated).await.unwrap().is_none());
        assert_eq!(bus.next_due(EventKind::IssueUpdated), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = bus.receive(EventKind::IssueUpdated).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.first_received_at, first_seen);
    }
}
