//! Consumer worker: pulls deliveries for one event kind off the bus and
//! routes every outcome to ack, delayed redelivery, or the dead-letter sink.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{Delivery, MessageBus};
use crate::consumers::{Applied, ConsumeError, ConsumerRegistry};
use crate::delivery::{DeadLetterEntry, DeadLetterSink, RetryPolicy};
use crate::error::{ErrorCode, Result, TallyError};
use crate::events::{EventEnvelope, EventKind};

/// Configuration for a consumer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum deliveries handled concurrently
    pub concurrency: usize,
    /// Wait between polls when the queue is empty
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight deliveries
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Age after which an unsettled delivery is put back on the queue
    #[serde(with = "humantime_serde")]
    pub lease_timeout: Duration,
    /// How often the loop looks for unsettled deliveries
    #[serde(with = "humantime_serde")]
    pub reclaim_interval: Duration,
    /// Worker name/identifier
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(30),
            name: "tally-consumer".to_string(),
        }
    }
}

/// Statistics for a consumer worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Deliveries received
    pub received: Arc<AtomicU64>,
    /// Events applied
    pub applied: Arc<AtomicU64>,
    /// Confirmed duplicates acknowledged without effect
    pub duplicates: Arc<AtomicU64>,
    /// Deliveries handed back for a later attempt
    pub retried: Arc<AtomicU64>,
    /// Deliveries moved to the dead-letter sink
    pub dead_lettered: Arc<AtomicU64>,
    /// Bus or sink operations that failed
    pub failed: Arc<AtomicU64>,
    /// Deliveries currently being handled
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled and acknowledged.
    Acked(Applied),
    /// Handed back to the bus for another attempt.
    Redelivered { delay: Duration },
    /// Moved to the dead-letter sink and acknowledged.
    DeadLettered { reason: String },
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for the worker loop to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker task failed");
        }
    }
}

/// Worker consuming one event kind.
pub struct ConsumerWorker {
    kind: EventKind,
    bus: Arc<dyn MessageBus>,
    registry: Arc<ConsumerRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl ConsumerWorker {
    pub fn new(
        kind: EventKind,
        bus: Arc<dyn MessageBus>,
        registry: Arc<ConsumerRegistry>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            kind,
            bus,
            registry,
            dead_letters,
            retry: RetryPolicy::default(),
            config: WorkerConfig::default(),
            stats: WorkerStats::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Receive and handle one delivery, if one is ready.
    pub async fn process_next(&self) -> Result<Option<Disposition>> {
        match self.bus.receive(self.kind).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle the deliveries pending when called; returns how many were
    /// handled.
    ///
    /// Bounded by the pending count at call time, so a delivery redelivered
    /// with no delay is not attempted twice in one drain.
    pub async fn drain(&self) -> Result<usize> {
        let pending = self.bus.pending(self.kind).await?;
        let mut handled = 0;
        while handled < pending {
            if self.process_next().await?.is_none() {
                break;
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Put deliveries whose ack or redelivery never reached the bus back on
    /// the queue once their lease has run out.
    pub async fn reclaim(&self) -> Result<usize> {
        self.bus.reclaim_stale(self.kind, self.config.lease_timeout).await
    }

    /// Dispatch one delivery and settle it on the bus.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition> {
        let span = info_span!(
            "consume",
            kind = %self.kind,
            event_id = tracing::field::Empty,
            attempt = delivery.attempt,
        );
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let result = self.settle(delivery).instrument(span).await;
        self.stats.active.fetch_sub(1, Ordering::Relaxed);

        match &result {
            Ok(disposition) => self.record(disposition),
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                e.log();
            }
        }
        result
    }

    async fn settle(&self, delivery: Delivery) -> Result<Disposition> {
        let outcome = match EventEnvelope::from_json(&delivery.payload) {
            Ok(envelope) if envelope.kind() != self.kind => {
                Err(ConsumeError::Malformed(TallyError::new(
                    ErrorCode::UnknownEventKind,
                    format!("{} event published on the {} queue", envelope.kind(), self.kind),
                )))
            }
            Ok(envelope) => {
                tracing::Span::current().record("event_id", tracing::field::display(envelope.event_id));
                self.registry.dispatch(&envelope).await
            }
            Err(e) => Err(ConsumeError::Malformed(e)),
        };

        match outcome {
            Ok(applied) => {
                if applied == Applied::Duplicate {
                    debug!("Duplicate delivery acknowledged");
                }
                self.bus.ack(&delivery).await?;
                Ok(Disposition::Acked(applied))
            }
            Err(err) if self.retry.should_retry(delivery.attempt, &err) => {
                let delay = self.retry.delay_after(delivery.attempt);
                warn!(reason = err.reason(), error = %err, ?delay, "Delivery will be retried");
                self.bus.redeliver(delivery, delay).await?;
                Ok(Disposition::Redelivered { delay })
            }
            Err(err) => {
                let mut entry = DeadLetterEntry::new(
                    self.kind,
                    delivery.payload.clone(),
                    delivery.attempt,
                    delivery.first_received_at,
                    &err,
                );
                if err.is_retryable() {
                    entry.reason = "retry_budget_exhausted".to_string();
                    entry.error_code = ErrorCode::RetryBudgetExhausted;
                }
                error!(
                    reason = %entry.reason,
                    code = %entry.error_code,
                    error = %err,
                    attempts = delivery.attempt,
                    "Delivery dead-lettered"
                );
                let reason = entry.reason.clone();
                self.dead_letters.push(entry).await?;
                self.bus.ack(&delivery).await?;
                Ok(Disposition::DeadLettered { reason })
            }
        }
    }

    fn record(&self, disposition: &Disposition) {
        let (counter, outcome) = match disposition {
            Disposition::Acked(Applied::Applied) => (&self.stats.applied, "applied"),
            Disposition::Acked(Applied::Duplicate) => (&self.stats.duplicates, "duplicate"),
            Disposition::Redelivered { .. } => (&self.stats.retried, "retried"),
            Disposition::DeadLettered { .. } => (&self.stats.dead_lettered, "dead_lettered"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            crate::telemetry::EVENTS_TOTAL,
            "kind" => self.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Start the worker loop, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let worker = Arc::new(self);

        let task = tokio::spawn(async move {
            let config = worker.config.clone();
            let concurrency = config.concurrency.max(1);
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut next_reclaim = Instant::now();

            info!(
                worker = %config.name,
                kind = %worker.kind,
                concurrency,
                "Consumer worker started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if Instant::now() >= next_reclaim {
                    if let Err(e) = worker.reclaim().await {
                        worker.stats.failed.fetch_add(1, Ordering::Relaxed);
                        e.log();
                    }
                    next_reclaim = Instant::now() + config.reclaim_interval;
                }

                let permit = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                match worker.bus.receive(worker.kind).await {
                    Ok(Some(delivery)) => {
                        let worker = Arc::clone(&worker);
                        tokio::spawn(async move {
                            // errors are logged and counted by handle()
                            let _ = worker.handle(delivery).await;
                            drop(permit);
                        });
                        continue;
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        worker.stats.failed.fetch_add(1, Ordering::Relaxed);
                        e.log();
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }

            info!(worker = %config.name, kind = %worker.kind, "Worker shutting down");
            let drained = tokio::time::timeout(
                config.shutdown_timeout,
                semaphore.acquire_many(concurrency as u32),
            )
            .await;
            if drained.is_err() {
                warn!(worker = %config.name, "In-flight deliveries still running at shutdown");
            }
            info!(worker = %config.name, kind = %worker.kind, "Worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.lease_timeout > config.reclaim_interval);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.received(), 0);
        assert_eq!(stats.dead_lettered(), 0);
        assert_eq!(stats.active(), 0);

        stats.applied.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.applied(), 1);
    }
}
