//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tally_core::consumers::{Applied, ConsumeError, ConsumerContext, ConsumerRegistry};
use tally_core::events::{
    AssignmentChanged, DomainEvent, EventEnvelope, IssueCreated, IssueDeleted, IssueUpdated,
    ProjectCreated, ProjectDeleted, UserCreated, UserDeleted, UserUpdated,
};
use tally_core::model::{
    IssueFields, IssueId, IssuePriority, IssueStatus, IssueType, ProjectId, RoleCode, UserFields,
    UserName,
};
use tally_core::projection::{ProjectCounters, ProjectionReader};
use tally_core::store::{InMemoryStore, KeyBuilder};
use tally_core::version::Version;

// ============================================================================
// Identifiers
// ============================================================================

pub fn pid(id: &str) -> ProjectId {
    ProjectId::new(id).unwrap()
}

pub fn iid(id: &str) -> IssueId {
    IssueId::new(id).unwrap()
}

pub fn uname(name: &str) -> UserName {
    UserName::new(name).unwrap()
}

pub fn fields(status: IssueStatus, priority: IssuePriority, issue_type: IssueType) -> IssueFields {
    IssueFields::new(status, priority, issue_type)
}

pub fn open_bug() -> IssueFields {
    fields(IssueStatus::Open, IssuePriority::Medium, IssueType::Bug)
}

pub fn user_fields(role_code: RoleCode, active: bool) -> UserFields {
    UserFields { role_code, active }
}

// ============================================================================
// Events
// ============================================================================

pub fn project_created(project: &str, version: Version) -> DomainEvent {
    DomainEvent::ProjectCreated(ProjectCreated {
        project_id: pid(project),
        initial_version: version,
    })
}

pub fn project_deleted(project: &str, version: Version) -> DomainEvent {
    DomainEvent::ProjectDeleted(ProjectDeleted {
        project_id: pid(project),
        version,
    })
}

pub fn issue_created(issue: &str, project: &str, version: Version, f: IssueFields) -> DomainEvent {
    DomainEvent::IssueCreated(IssueCreated {
        issue_id: iid(issue),
        project_id: pid(project),
        initial_version: version,
        fields: f,
    })
}

pub fn issue_updated(
    issue: &str,
    project: &str,
    (old_version, old_fields): (Version, IssueFields),
    (new_version, new_fields): (Version, IssueFields),
) -> DomainEvent {
    DomainEvent::IssueUpdated(IssueUpdated {
        issue_id: iid(issue),
        project_id: pid(project),
        old_version,
        new_version,
        old_fields,
        new_fields,
    })
}

pub fn issue_deleted(issue: &str, project: &str, version: Version, f: IssueFields) -> DomainEvent {
    DomainEvent::IssueDeleted(IssueDeleted {
        issue_id: iid(issue),
        project_id: pid(project),
        version,
        fields: f,
    })
}

pub fn assignment_created(project: &str, user: &str) -> DomainEvent {
    DomainEvent::AssignmentCreated(AssignmentChanged {
        project_id: pid(project),
        user_name: uname(user),
        version: Version::generate(),
    })
}

pub fn assignment_deleted(project: &str, user: &str) -> DomainEvent {
    DomainEvent::AssignmentDeleted(AssignmentChanged {
        project_id: pid(project),
        user_name: uname(user),
        version: Version::generate(),
    })
}

pub fn user_created(user: &str, version: Version, f: UserFields) -> DomainEvent {
    DomainEvent::UserCreated(UserCreated {
        user_name: uname(user),
        initial_version: version,
        fields: f,
    })
}

pub fn user_updated(
    user: &str,
    (old_version, old_fields): (Version, UserFields),
    (new_version, new_fields): (Version, UserFields),
) -> DomainEvent {
    DomainEvent::UserUpdated(UserUpdated {
        user_name: uname(user),
        old_version,
        new_version,
        old_fields,
        new_fields,
    })
}

pub fn user_deleted(user: &str, version: Version, f: UserFields) -> DomainEvent {
    DomainEvent::UserDeleted(UserDeleted {
        user_name: uname(user),
        version,
        fields: f,
    })
}

// ============================================================================
// Harness
// ============================================================================

/// An in-memory projection with every consumer registered.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub registry: Arc<ConsumerRegistry>,
    pub reader: ProjectionReader,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_grace(tally_core::consumers::DEFAULT_GRACE_TTL)
    }

    pub fn with_grace(ttl: Duration) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let ctx = ConsumerContext::new(store.clone())
            .with_project_grace_ttl(ttl)
            .with_user_grace_ttl(ttl);
        Self {
            registry: Arc::new(ConsumerRegistry::with_defaults(ctx)),
            reader: ProjectionReader::new(store.clone(), KeyBuilder::default()),
            store,
        }
    }

    pub async fn apply(&self, event: DomainEvent) -> Result<Applied, ConsumeError> {
        self.registry.dispatch(&EventEnvelope::new(event)).await
    }

    pub async fn apply_ok(&self, event: DomainEvent) -> Applied {
        self.apply(event).await.unwrap()
    }

    pub async fn counters(&self, project: &str) -> ProjectCounters {
        self.reader
            .counters(&pid(project))
            .await
            .unwrap()
            .expect("project is projected")
    }
}
