//! Assignment consumers: maintain a project's member set.
//!
//! Adding a user who is already a member, or removing one who is not, is a
//! business-rule violation that no amount of redelivery can fix.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{Applied, ConsumeError, Consumer, ConsumerContext};
use crate::events::{AssignmentChanged, DomainEvent, EventEnvelope, EventKind};
use crate::store::Transaction;

pub struct AssignmentCreatedConsumer {
    ctx: ConsumerContext,
}

impl AssignmentCreatedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for AssignmentCreatedConsumer {
    fn name(&self) -> &'static str {
        "assignment-created"
    }

    fn kind(&self) -> EventKind {
        EventKind::AssignmentCreated
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::AssignmentCreated(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let AssignmentChanged {
            project_id,
            user_name,
            ..
        } = event;
        let keys = &self.ctx.keys;
        let members = keys.members(project_id);

        let tx = Transaction::new()
            .require_exists(keys.project_exists(project_id))
            .require_not_member(&members, user_name.as_str())
            .sadd(&members, user_name.as_str());
        let tx = self.ctx.within_project_lifetime(tx, project_id);

        if self.ctx.commit(tx).await? {
            debug!(project = %project_id, user = %user_name, "Member added");
            return Ok(Applied::Applied);
        }

        self.ctx.require_project(project_id).await?;
        Err(ConsumeError::membership(format!(
            "{} is already a member of project {}",
            user_name, project_id
        )))
    }
}

pub struct AssignmentDeletedConsumer {
    ctx: ConsumerContext,
}

impl AssignmentDeletedConsumer {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Consumer for AssignmentDeletedConsumer {
    fn name(&self) -> &'static str {
        "assignment-deleted"
    }

    fn kind(&self) -> EventKind {
        EventKind::AssignmentDeleted
    }

    #[instrument(skip_all, fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Applied, ConsumeError> {
        let DomainEvent::AssignmentDeleted(event) = &envelope.event else {
            return Err(ConsumeError::wrong_consumer(self.kind(), envelope.kind()));
        };
        let AssignmentChanged {
            project_id,
            user_name,
            ..
        } = event;
        let keys = &self.ctx.keys;
        let members = keys.members(project_id);

        let tx = Transaction::new()
            .require_exists(keys.project_exists(project_id))
            .require_member(&members, user_name.as_str())
            .srem(&members, user_name.as_str());
        let tx = self.ctx.within_project_lifetime(tx, project_id);

        if self.ctx.commit(tx).await? {
            debug!(project = %project_id, user = %user_name, "Member removed");
            return Ok(Applied::Applied);
        }

        self.ctx.require_project(project_id).await?;
        Err(ConsumeError::membership(format!(
            "{} is not a member of project {}",
            user_name, project_id
        )))
    }
}
