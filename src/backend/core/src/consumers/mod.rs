//! Idempotent event consumers.
//!
//! One [`Consumer`] per [`EventKind`]. Every handler follows the same shape:
//! build one conditional transaction from the event, commit it, and only if
//! a precondition failed read the projection to classify why. Nothing is
//! cached between attempts, so a redelivered event is always evaluated
//! against the current state.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

use crate::error::{ErrorCode, TallyError};
use crate::events::{EventEnvelope, EventKind};
use crate::model::ProjectId;
use crate::store::{KeyBuilder, ProjectionStore, Transaction};

pub mod assignment;
pub mod issue;
pub mod project;
pub mod user;

pub use assignment::{AssignmentCreatedConsumer, AssignmentDeletedConsumer};
pub use issue::{IssueCreatedConsumer, IssueDeletedConsumer, IssueUpdatedConsumer};
pub use project::{ProjectCreatedConsumer, ProjectDeletedConsumer};
pub use user::{UserCreatedConsumer, UserDeletedConsumer, UserUpdatedConsumer};

/// Default grace period before a deleted aggregate's projection disappears.
pub const DEFAULT_GRACE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

/// Successful handling of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The transaction committed.
    Applied,
    /// The event had already been applied; nothing changed.
    Duplicate,
}

impl Applied {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Why an event could not be applied.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The store could not be reached or answered with an error.
    #[error("projection store failure: {0}")]
    Store(#[source] TallyError),

    /// The parent aggregate is not projected yet.
    #[error("{0} is not projected yet")]
    NotYetApplicable(String),

    /// The version this event builds on has not been applied yet.
    #[error("{aggregate} is not at version {expected} yet")]
    Premature { aggregate: String, expected: String },

    /// Retrying will never succeed.
    #[error("business rule violated: {message}")]
    BusinessRule { code: ErrorCode, message: String },

    /// The payload could not be decoded or was routed to the wrong consumer.
    #[error("malformed event: {0}")]
    Malformed(#[source] TallyError),
}

impl ConsumeError {
    pub fn premature(aggregate: impl Into<String>, expected: impl ToString) -> Self {
        Self::Premature {
            aggregate: aggregate.into(),
            expected: expected.to_string(),
        }
    }

    /// A membership change that contradicts the projected member set.
    pub fn membership(message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code: ErrorCode::MembershipViolation,
            message: message.into(),
        }
    }

    /// An aggregate id already taken by a different aggregate.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code: ErrorCode::AggregateConflict,
            message: message.into(),
        }
    }

    /// Whether redelivery can eventually succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::NotYetApplicable(_) | Self::Premature { .. }
        )
    }

    /// Short, stable label for logs, metrics and dead-letter entries.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::NotYetApplicable(_) => "not_yet_applicable",
            Self::Premature { .. } => "premature",
            Self::BusinessRule { .. } => "business_rule",
            Self::Malformed(_) => "malformed",
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Store(e) | Self::Malformed(e) => e.code(),
            Self::NotYetApplicable(_) => ErrorCode::ProjectNotProjected,
            Self::Premature { .. } => ErrorCode::VersionMismatch,
            Self::BusinessRule { code, .. } => *code,
        }
    }

    fn wrong_consumer(expected: EventKind, actual: EventKind) -> Self {
        Self::Malformed(TallyError::new(
            ErrorCode::UnknownEventKind,
            format!("{} consumer received a {} event", expected, actual),
        ))
    }
}

impl From<TallyError> for ConsumeError {
    fn from(error: TallyError) -> Self {
        match error.code() {
            ErrorCode::MalformedEvent
            | ErrorCode::InvalidVersion
            | ErrorCode::UnknownEventKind
            | ErrorCode::DeserializationError => Self::Malformed(error),
            _ => Self::Store(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consumer Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Handler for one event kind.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> EventKind;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError>;
}

/// Store handle and settings shared by every consumer.
#[derive(Clone)]
pub struct ConsumerContext {
    pub store: Arc<dyn ProjectionStore>,
    pub keys: KeyBuilder,
    pub project_grace_ttl: Duration,
    pub user_grace_ttl: Duration,
}

impl ConsumerContext {
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        Self {
            store,
            keys: KeyBuilder::default(),
            project_grace_ttl: DEFAULT_GRACE_TTL,
            user_grace_ttl: DEFAULT_GRACE_TTL,
        }
    }

    pub fn with_keys(mut self, keys: KeyBuilder) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_project_grace_ttl(mut self, ttl: Duration) -> Self {
        self.project_grace_ttl = ttl;
        self
    }

    pub fn with_user_grace_ttl(mut self, ttl: Duration) -> Self {
        self.user_grace_ttl = ttl;
        self
    }

    /// Commit `tx`, returning whether it was applied.
    pub(crate) async fn commit(&self, tx: Transaction) -> Result<bool, ConsumeError> {
        let start = Instant::now();
        let outcome = self.store.commit(tx).await.map_err(ConsumeError::Store)?;
        metrics::histogram!(crate::telemetry::COMMIT_SECONDS, "backend" => self.store.name())
            .record(start.elapsed().as_secs_f64());
        trace!(?outcome, "Commit finished");
        Ok(outcome.is_committed())
    }

    pub(crate) async fn project_exists(&self, project: &ProjectId) -> Result<bool, ConsumeError> {
        self.store
            .exists(&self.keys.project_exists(project))
            .await
            .map_err(ConsumeError::Store)
    }

    /// Make every key `tx` writes expire with the project.
    ///
    /// A no-op while the project is live. During the grace period of a
    /// deleted project, keys first created by late events would otherwise
    /// outlive it.
    pub(crate) fn within_project_lifetime(&self, tx: Transaction, project: &ProjectId) -> Transaction {
        let exists = self.keys.project_exists(project);
        let mut written: Vec<String> = Vec::new();
        for op in &tx.ops {
            if op.key() != exists && !written.iter().any(|k| k == op.key()) {
                written.push(op.key().to_string());
            }
        }
        written
            .into_iter()
            .fold(tx, |tx, key| tx.inherit_expiry(key, &exists))
    }

    pub(crate) async fn require_project(&self, project: &ProjectId) -> Result<(), ConsumeError> {
        if self.project_exists(project).await? {
            Ok(())
        } else {
            Err(ConsumeError::NotYetApplicable(format!("project {}", project)))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Routes envelopes to the consumer registered for their kind.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: DashMap<EventKind, Arc<dyn Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a consumer for every event kind.
    pub fn with_defaults(ctx: ConsumerContext) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ProjectCreatedConsumer::new(ctx.clone())));
        registry.register(Arc::new(ProjectDeletedConsumer::new(ctx.clone())));
        registry.register(Arc::new(IssueCreatedConsumer::new(ctx.clone())));
        registry.register(Arc::new(IssueUpdatedConsumer::new(ctx.clone())));
        registry.register(Arc::new(IssueDeletedConsumer::new(ctx.clone())));
        registry.register(Arc::new(AssignmentCreatedConsumer::new(ctx.clone())));
        registry.register(Arc::new(AssignmentDeletedConsumer::new(ctx.clone())));
        registry.register(Arc::new(UserCreatedConsumer::new(ctx.clone())));
        registry.register(Arc::new(UserUpdatedConsumer::new(ctx.clone())));
        registry.register(Arc::new(UserDeletedConsumer::new(ctx)));
        registry
    }

    /// Register a consumer, replacing any previous one for the same kind.
    pub fn register(&self, consumer: Arc<dyn Consumer>) {
        self.consumers.insert(consumer.kind(), consumer);
    }

    pub fn get(&self, kind: EventKind) -> Option<Arc<dyn Consumer>> {
        self.consumers.get(&kind).map(|c| Arc::clone(c.value()))
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.consumers.iter().map(|e| *e.key()).collect();
        kinds.sort();
        kinds
    }

    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let consumer = self.get(envelope.kind()).ok_or_else(|| {
            ConsumeError::Malformed(TallyError::new(
                ErrorCode::UnknownEventKind,
                format!("No consumer registered for {}", envelope.kind()),
            ))
        })?;
        consumer.handle(envelope).await
    }
}
