//! Inbound event schema.
//!
//! Events arrive as JSON [`EventEnvelope`]s, one bus queue per [`EventKind`].
//! [`DomainEvent`] is a closed tagged union: a payload whose `type` tag is
//! unknown or whose fields do not decode is a malformed event, never a
//! business error.

pub mod event;

pub use event::*;
