//! Project consumers: create and retire a project's projection.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{Applied, ConsumeError, Consumer, ConsumerContext};
use crate::events::{DomainEvent, EventEnvelope, EventKind};
use crate::model::{Bucket, IssuePriority, IssueStatus, IssueType};
use crate::store::{Counter, Transaction};

fn bucket_codes(counter: Counter) -> Vec<&'static str> {
    match counter {
        Counter::Status => IssueStatus::ALL.iter().map(|b| b.code()).collect(),
        Counter::Priority => IssuePriority::ALL.iter().map(|b| b.code()).collect(),
        Counter::Type => IssueType::ALL.iter().map(|b| b.code()).collect(),
    }
}

pub struct ProjectCreatedConsumer {
    ctx: ConsumerContext,
}

impl ProjectCreatedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for ProjectCreatedConsumer {
    fn name(&self) -> &'static str {
        "project-created"
    }

    fn kind(&self) -> EventKind {
        EventKind::ProjectCreated
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::ProjectCreated(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let keys = &self.ctx.keys;
        let project = &event.project_id;
        let exists = keys.project_exists(project);
        let version = event.initial_version.as_token();

        // Every bucket of every counter starts at zero.
        let mut tx = Transaction::new().require_absent(&exists).set(&exists, &version);
        for counter in Counter::ALL {
            let key = keys.counter(project, counter);
            for code in bucket_codes(counter) {
                tx = tx.hset(&key, code, "0");
            }
        }

        if self.ctx.commit(tx).await? {
            info!(project = %project, "Project projection created");
            return Ok(Applied::Applied);
        }

        match self.ctx.store.get(&exists).await? {
            Some(current) if current != version => Err(ConsumeError::conflict(format!(
                "project {} already projected under version {}",
                project, current
            ))),
            Some(_) => Ok(Applied::Duplicate),
            // expired between commit and read
            None => Err(ConsumeError::premature(format!("project {}", project), version)),
        }
    }
}

pub struct ProjectDeletedConsumer {
    ctx: ConsumerContext,
}

impl ProjectDeletedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for ProjectDeletedConsumer {
    fn name(&self) -> &'static str {
        "project-deleted"
    }

    fn kind(&self) -> EventKind {
        EventKind::ProjectDeleted
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::ProjectDeleted(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let keys = &self.ctx.keys;
        let project = &event.project_id;
        let exists = keys.project_exists(project);
        let deleted = keys.project_deleted(project);
        let ttl = self.ctx.project_grace_ttl;

        // The marker is written before the expiries so it expires with the rest.
        let mut tx = Transaction::new()
            .require_exists(&exists)
            .require_absent(&deleted)
            .set(&deleted, event.version.as_token());
        for key in keys.project_keys(project) {
            tx = tx.expire(key, ttl);
        }

        if self.ctx.commit(tx).await? {
            info!(project = %project, grace = ?ttl, "Project projection scheduled for removal");
            return Ok(Applied::Applied);
        }

        self.ctx.require_project(project).await?;
        if self.ctx.store.exists(&deleted).await? {
            debug!(project = %project, "Project already in its grace period");
            return Ok(Applied::Duplicate);
        }
        // state moved between commit and read
        Err(ConsumeError::premature(format!("project {}", project), event.version))
    }
}
