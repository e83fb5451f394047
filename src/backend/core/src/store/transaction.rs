//! Conditional transactions: the only way to mutate the projection.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A condition that must hold for a transaction to commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Precondition {
    KeyExists { key: String },
    KeyAbsent { key: String },
    HashFieldEquals { key: String, field: String, value: String },
    HashFieldAbsent { key: String, field: String },
    SetContains { key: String, member: String },
    SetNotContains { key: String, member: String },
}

impl Precondition {
    pub fn key(&self) -> &str {
        match self {
            Self::KeyExists { key }
            | Self::KeyAbsent { key }
            | Self::HashFieldEquals { key, .. }
            | Self::HashFieldAbsent { key, .. }
            | Self::SetContains { key, .. }
            | Self::SetNotContains { key, .. } => key,
        }
    }
}

/// A write applied when every precondition holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    HashIncrement { key: String, field: String, delta: i64 },
    HashSet { key: String, field: String, value: String },
    HashDelete { key: String, field: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    StringSet { key: String, value: String },
    Expire { key: String, seconds: u64 },
    /// Give `key` the remaining expiry of `source`; no-op when `source` has none.
    InheritExpiry { key: String, source: String },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Self::HashIncrement { key, .. }
            | Self::HashSet { key, .. }
            | Self::HashDelete { key, .. }
            | Self::SetAdd { key, .. }
            | Self::SetRemove { key, .. }
            | Self::StringSet { key, .. }
            | Self::Expire { key, .. }
            | Self::InheritExpiry { key, .. } => key,
        }
    }

    /// Key read by the operation besides the one it writes.
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::InheritExpiry { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result of submitting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every precondition held and every operation was applied.
    Committed,
    /// At least one precondition failed; nothing was written.
    PreconditionFailed,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// An atomic group of preconditions and operations.
///
/// Built with the fluent methods below and handed to
/// [`ProjectionStore::commit`](super::ProjectionStore::commit).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "checks")]
    pub preconditions: Vec<Precondition>,
    pub ops: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Preconditions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn require_exists(mut self, key: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::KeyExists { key: key.into() });
        self
    }

    pub fn require_absent(mut self, key: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::KeyAbsent { key: key.into() });
        self
    }

    pub fn require_field_eq(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.preconditions.push(Precondition::HashFieldEquals {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn require_field_absent(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::HashFieldAbsent {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn require_member(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::SetContains {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn require_not_member(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::SetNotContains {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn hincr(mut self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        self.ops.push(Operation::HashIncrement {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    pub fn hset(
        mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.ops.push(Operation::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hdel(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.ops.push(Operation::HashDelete {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Operation::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Operation::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(Operation::StringSet {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Expire `key` after `ttl`, rounded up to whole seconds (minimum one).
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        let mut seconds = ttl.as_secs();
        if ttl.subsec_nanos() > 0 || seconds == 0 {
            seconds += 1;
        }
        self.ops.push(Operation::Expire {
            key: key.into(),
            seconds,
        });
        self
    }

    /// Expire `key` together with `source` if `source` is already expiring.
    pub fn inherit_expiry(mut self, key: impl Into<String>, source: impl Into<String>) -> Self {
        self.ops.push(Operation::InheritExpiry {
            key: key.into(),
            source: source.into(),
        });
        self
    }

    /// Every distinct key the transaction touches, in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        let all = self
            .preconditions
            .iter()
            .map(Precondition::key)
            .chain(
                self.ops
                    .iter()
                    .flat_map(|op| std::iter::once(op.key()).chain(op.source())),
            );
        for key in all {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_checks_and_ops() {
        let tx = Transaction::new()
            .require_exists("a")
            .require_field_eq("b", "f", "v1")
            .hincr("c", "OPEN", 1)
            .hset("b", "f", "v2");

        assert_eq!(tx.preconditions.len(), 2);
        assert_eq!(tx.ops.len(), 2);
        assert_eq!(tx.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_inherited_expiry_source_is_a_touched_key() {
        let tx = Transaction::new().sadd("members", "bob").inherit_expiry("members", "exists");
        assert_eq!(tx.keys(), vec!["members", "exists"]);
    }

    #[test]
    fn test_expire_rounds_up_to_whole_seconds() {
        let tx = Transaction::new()
            .expire("a", Duration::from_millis(1500))
            .expire("b", Duration::ZERO)
            .expire("c", Duration::from_secs(60));

        let seconds: Vec<u64> = tx
            .ops
            .iter()
            .map(|op| match op {
                Operation::Expire { seconds, .. } => *seconds,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(seconds, vec![2, 1, 60]);
    }

    #[test]
    fn test_serializes_with_kind_tags_for_the_script() {
        let tx = Transaction::new().require_not_member("m", "alice").sadd("m", "alice");
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["checks"][0]["kind"], "set_not_contains");
        assert_eq!(json["ops"][0]["kind"], "set_add");
        assert_eq!(json["ops"][0]["member"], "alice");
    }
}
