//! Issue consumers: keep the per-project counters and the issue version
//! map in step with issue events.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{Applied, ConsumeError, Consumer, ConsumerContext};
use crate::events::{DomainEvent, EventEnvelope, EventKind};
use crate::model::{Bucket, IssueFields, IssueId, ProjectId};
use crate::store::keys::applied_issue_member;
use crate::store::{Counter, Transaction};
use crate::version::Version;

/// The bucket an issue with `fields` occupies in each counter.
fn occupied_buckets(fields: &IssueFields) -> [(Counter, &'static str); 3] {
    [
        (Counter::Status, fields.status.code()),
        (Counter::Priority, fields.priority.code()),
        (Counter::Type, fields.issue_type.code()),
    ]
}

fn count_issue(
    ctx: &ConsumerContext,
    mut tx: Transaction,
    project: &ProjectId,
    fields: &IssueFields,
    delta: i64,
) -> Transaction {
    for (counter, code) in occupied_buckets(fields) {
        tx = tx.hincr(ctx.keys.counter(project, counter), code, delta);
    }
    tx
}

fn issue_label(issue: &IssueId) -> String {
    format!("issue {}", issue)
}

/// Whether `version` was ever applied to `issue`.
async fn was_applied(
    ctx: &ConsumerContext,
    project: &ProjectId,
    issue: &IssueId,
    version: &Version,
) -> Result<bool, ConsumeError> {
    Ok(ctx
        .store
        .set_contains(
            &ctx.keys.applied_issue_versions(project),
            &applied_issue_member(issue, version),
        )
        .await?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Created
// ═══════════════════════════════════════════════════════════════════════════════

pub struct IssueCreatedConsumer {
    ctx: ConsumerContext,
}

impl IssueCreatedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for IssueCreatedConsumer {
    fn name(&self) -> &'static str {
        "issue-created"
    }

    fn kind(&self) -> EventKind {
        EventKind::IssueCreated
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::IssueCreated(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let keys = &self.ctx.keys;
        let project = &event.project_id;
        let versions = keys.issue_versions(project);
        let applied = keys.applied_issue_versions(project);
        let member = applied_issue_member(&event.issue_id, &event.initial_version);
        let version = event.initial_version.as_token();

        let tx = Transaction::new()
            .require_exists(keys.project_exists(project))
            .require_field_absent(&versions, event.issue_id.as_str())
            .require_not_member(&applied, &member)
            .hset(&versions, event.issue_id.as_str(), &version)
            .sadd(&applied, &member);
        let tx = count_issue(&self.ctx, tx, project, &event.fields, 1);
        let tx = self.ctx.within_project_lifetime(tx, project);

        if self.ctx.commit(tx).await? {
            debug!(issue = %event.issue_id, project = %project, "Issue counted");
            return Ok(Applied::Applied);
        }

        self.ctx.require_project(project).await?;
        if was_applied(&self.ctx, project, &event.issue_id, &event.initial_version).await? {
            return Ok(Applied::Duplicate);
        }
        match self.ctx.store.hash_get(&versions, event.issue_id.as_str()).await? {
            Some(current) if current != version => Err(ConsumeError::conflict(format!(
                "issue {} already tracked in project {} under version {}",
                event.issue_id, project, current
            ))),
            // state moved between commit and read
            _ => Err(ConsumeError::premature(issue_label(&event.issue_id), version)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Updated
// ═══════════════════════════════════════════════════════════════════════════════

pub struct IssueUpdatedConsumer {
    ctx: ConsumerContext,
}

impl IssueUpdatedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for IssueUpdatedConsumer {
    fn name(&self) -> &'static str {
        "issue-updated"
    }

    fn kind(&self) -> EventKind {
        EventKind::IssueUpdated
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::IssueUpdated(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        envelope.event.validate().map_err(ConsumeError::Malformed)?;
        let keys = &self.ctx.keys;
        let project = &event.project_id;
        let versions = keys.issue_versions(project);

        let mut tx = Transaction::new()
            .require_exists(keys.project_exists(project))
            .require_field_eq(&versions, event.issue_id.as_str(), event.old_version.as_token());

        let moves = occupied_buckets(&event.old_fields)
            .into_iter()
            .zip(occupied_buckets(&event.new_fields));
        for ((counter, old), (_, new)) in moves {
            if old != new {
                let key = keys.counter(project, counter);
                tx = tx.hincr(&key, old, -1).hincr(&key, new, 1);
            }
        }

        let tx = tx
            .hset(&versions, event.issue_id.as_str(), event.new_version.as_token())
            .sadd(
                keys.applied_issue_versions(project),
                applied_issue_member(&event.issue_id, &event.new_version),
            );
        let tx = self.ctx.within_project_lifetime(tx, project);

        if self.ctx.commit(tx).await? {
            debug!(issue = %event.issue_id, project = %project, "Issue counters moved");
            return Ok(Applied::Applied);
        }

        self.ctx.require_project(project).await?;
        if was_applied(&self.ctx, project, &event.issue_id, &event.new_version).await? {
            return Ok(Applied::Duplicate);
        }
        Err(ConsumeError::premature(issue_label(&event.issue_id), event.old_version))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deleted
// ═══════════════════════════════════════════════════════════════════════════════

pub struct IssueDeletedConsumer {
    ctx: ConsumerContext,
}

impl IssueDeletedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for IssueDeletedConsumer {
    fn name(&self) -> &'static str {
        "issue-deleted"
    }

    fn kind(&self) -> EventKind {
        EventKind::IssueDeleted
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::IssueDeleted(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let keys = &self.ctx.keys;
        let project = &event.project_id;
        let versions = keys.issue_versions(project);

        let tx = Transaction::new()
            .require_exists(keys.project_exists(project))
            .require_field_eq(&versions, event.issue_id.as_str(), event.version.as_token())
            .hdel(&versions, event.issue_id.as_str());
        let tx = count_issue(&self.ctx, tx, project, &event.fields, -1);
        let tx = self.ctx.within_project_lifetime(tx, project);

        if self.ctx.commit(tx).await? {
            debug!(issue = %event.issue_id, project = %project, "Issue uncounted");
            return Ok(Applied::Applied);
        }

        self.ctx.require_project(project).await?;
        let tracked = self
            .ctx
            .store
            .hash_get(&versions, event.issue_id.as_str())
            .await?
            .is_some();
        if !tracked && was_applied(&self.ctx, project, &event.issue_id, &event.version).await? {
            return Ok(Applied::Duplicate);
        }
        Err(ConsumeError::premature(issue_label(&event.issue_id), event.version))
    }
}
