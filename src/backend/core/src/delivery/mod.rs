//! Delivery policy: how failed events are retried and where they end up.
//!
//! - **retry**: [`RetryPolicy`] and [`BackoffStrategy`] decide whether and
//!   when a failed delivery is attempted again
//! - **dead_letter**: [`DeadLetterSink`] stores deliveries that will never be
//!   retried, for operator inspection and requeue

pub mod dead_letter;
pub mod retry;

pub use dead_letter::{DeadLetterEntry, DeadLetterSink, InMemoryDeadLetters, RedisDeadLetters};
pub use retry::{BackoffStrategy, RetryPolicy};
