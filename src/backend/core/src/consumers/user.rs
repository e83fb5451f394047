//! User consumers: maintain the user profile projection used for access
//! checks. Same version protocol as issues, without a parent aggregate.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{Applied, ConsumeError, Consumer, ConsumerContext};
use crate::events::{DomainEvent, EventEnvelope, EventKind};
use crate::model::{Bucket, UserFields, UserName};
use crate::store::keys::user_field;
use crate::store::Transaction;
use crate::version::Version;

fn write_fields(tx: Transaction, profile: &str, fields: &UserFields) -> Transaction {
    tx.hset(profile, user_field::ROLE, fields.role_code.code())
        .hset(profile, user_field::ACTIVE, fields.active.to_string())
}

fn user_label(user: &UserName) -> String {
    format!("user {}", user)
}

async fn was_applied(
    ctx: &ConsumerContext,
    user: &UserName,
    version: &Version,
) -> Result<bool, ConsumeError> {
    Ok(ctx
        .store
        .set_contains(&ctx.keys.applied_user_versions(user), &version.as_token())
        .await?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Created
// ═══════════════════════════════════════════════════════════════════════════════

pub struct UserCreatedConsumer {
    ctx: ConsumerContext,
}

impl UserCreatedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for UserCreatedConsumer {
    fn name(&self) -> &'static str {
        "user-created"
    }

    fn kind(&self) -> EventKind {
        EventKind::UserCreated
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::UserCreated(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let keys = &self.ctx.keys;
        let profile = keys.user_profile(&event.user_name);
        let applied = keys.applied_user_versions(&event.user_name);
        let version = event.initial_version.as_token();

        let tx = Transaction::new()
            .require_field_absent(&profile, user_field::VERSION)
            .require_not_member(&applied, &version)
            .hset(&profile, user_field::USERNAME, event.user_name.as_str())
            .hset(&profile, user_field::VERSION, &version)
            .hset(&profile, user_field::DELETED, "false")
            .sadd(&applied, &version);
        let tx = write_fields(tx, &profile, &event.fields);

        if self.ctx.commit(tx).await? {
            debug!(user = %event.user_name, role = %event.fields.role_code, "User projected");
            return Ok(Applied::Applied);
        }

        if was_applied(&self.ctx, &event.user_name, &event.initial_version).await? {
            return Ok(Applied::Duplicate);
        }
        match self.ctx.store.hash_get(&profile, user_field::VERSION).await? {
            Some(current) => Err(ConsumeError::conflict(format!(
                "user name {} is still held at version {}",
                event.user_name, current
            ))),
            None => Err(ConsumeError::premature(user_label(&event.user_name), version)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Updated
// ═══════════════════════════════════════════════════════════════════════════════

pub struct UserUpdatedConsumer {
    ctx: ConsumerContext,
}

impl UserUpdatedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for UserUpdatedConsumer {
    fn name(&self) -> &'static str {
        "user-updated"
    }

    fn kind(&self) -> EventKind {
        EventKind::UserUpdated
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::UserUpdated(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        envelope.event.validate().map_err(ConsumeError::Malformed)?;
        let keys = &self.ctx.keys;
        let profile = keys.user_profile(&event.user_name);
        let new_version = event.new_version.as_token();

        let tx = Transaction::new()
            .require_field_eq(&profile, user_field::VERSION, event.old_version.as_token())
            .hset(&profile, user_field::VERSION, &new_version)
            .sadd(keys.applied_user_versions(&event.user_name), &new_version);
        let tx = write_fields(tx, &profile, &event.new_fields);

        if self.ctx.commit(tx).await? {
            debug!(user = %event.user_name, "User profile updated");
            return Ok(Applied::Applied);
        }

        if was_applied(&self.ctx, &event.user_name, &event.new_version).await? {
            return Ok(Applied::Duplicate);
        }
        Err(ConsumeError::premature(user_label(&event.user_name), event.old_version))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deleted
// ═══════════════════════════════════════════════════════════════════════════════

pub struct UserDeletedConsumer {
    ctx: ConsumerContext,
}

impl UserDeletedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for UserDeletedConsumer {
    fn name(&self) -> &'static str {
        "user-deleted"
    }

    fn kind(&self) -> EventKind {
        EventKind::UserDeleted
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::UserDeleted(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let keys = &self.ctx.keys;
        let profile = keys.user_profile(&event.user_name);
        let version = event.version.as_token();
        let ttl = self.ctx.user_grace_ttl;

        let mut tx = Transaction::new()
            .require_field_eq(&profile, user_field::VERSION, &version)
            .require_field_eq(&profile, user_field::DELETED, "false")
            .hset(&profile, user_field::DELETED, "true")
            .hset(&profile, user_field::ACTIVE, "false");
        for key in keys.user_keys(&event.user_name) {
            tx = tx.expire(key, ttl);
        }

        if self.ctx.commit(tx).await? {
            info!(user = %event.user_name, grace = ?ttl, "User marked deleted");
            return Ok(Applied::Applied);
        }

        let current = self.ctx.store.hash_get_all(&profile).await?;
        let deleted = current.get(user_field::DELETED).is_some_and(|d| d == "true");
        let same_version = current.get(user_field::VERSION) == Some(&version);
        if deleted && same_version {
            return Ok(Applied::Duplicate);
        }
        Err(ConsumeError::premature(user_label(&event.user_name), version))
    }
}
