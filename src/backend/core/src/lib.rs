#![allow(clippy::result_large_err)]
//! # Tally Core
//!
//! Idempotent projection consistency engine for the issue tracker read model.
//!
//! Write-side services publish domain events at least once; consumers apply
//! them to a projection store through conditional transactions keyed on
//! opaque version tokens, so duplicates, reordering and races converge on
//! the same counters and membership sets.
//!
//! ## Architecture
//!
//! - **Version**: opaque per-mutation tokens compared only for equality
//! - **Store**: conditional multi-key transactions (in-memory and Redis)
//! - **Events**: closed, tagged event schema with a JSON envelope
//! - **Consumers**: one idempotent handler per event kind
//! - **Delivery**: bounded retry with backoff and a dead-letter sink
//! - **Bus**: at-least-once per-kind queues (in-memory and Redis)
//! - **Worker**: concurrent consume loop with graceful shutdown
//! - **Projection / Access**: typed read views and access derivation
//! - **Telemetry**: structured logging and metric descriptions

pub mod access;
pub mod bus;
pub mod config;
pub mod consumers;
pub mod delivery;
pub mod error;
pub mod events;
pub mod model;
pub mod projection;
pub mod store;
pub mod telemetry;
pub mod version;
pub mod worker;

pub use error::{ErrorCode, ErrorSeverity, Result, TallyError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::access::{AccessDecision, AccessResolver};
    pub use crate::bus::{Delivery, InMemoryBus, MessageBus, RedisBus, RedisBusConfig};
    pub use crate::config::{BusBackend, Config};
    pub use crate::consumers::{
        Applied, ConsumeError, Consumer, ConsumerContext, ConsumerRegistry,
    };
    pub use crate::delivery::{
        BackoffStrategy, DeadLetterEntry, DeadLetterSink, InMemoryDeadLetters, RedisDeadLetters,
        RetryPolicy,
    };
    pub use crate::error::{ErrorCode, Result, TallyError};
    pub use crate::events::{DomainEvent, EventEnvelope, EventId, EventKind};
    pub use crate::model::{
        IssueFields, IssueId, IssuePriority, IssueStatus, IssueType, ProjectId, RoleCode,
        UserFields, UserName,
    };
    pub use crate::projection::{
        ProjectCounters, ProjectState, ProjectView, ProjectionReader, UserView,
    };
    pub use crate::store::{
        InMemoryStore, KeyBuilder, ProjectionStore, RedisStore, RedisStoreConfig, Transaction,
    };
    pub use crate::version::Version;
    pub use crate::worker::{ConsumerWorker, Disposition, WorkerConfig, WorkerHandle, WorkerStats};
}
