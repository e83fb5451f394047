//! Domain events and the envelope they travel in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorCode, Result, TallyError};
use crate::model::{IssueFields, IssueId, ProjectId, UserFields, UserName};
use crate::version::Version;

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCreated {
    pub project_id: ProjectId,
    pub initial_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDeleted {
    pub project_id: ProjectId,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCreated {
    pub issue_id: IssueId,
    pub project_id: ProjectId,
    pub initial_version: Version,
    pub fields: IssueFields,
}

/// An issue mutation. `old_version` is the token the mutation replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueUpdated {
    pub issue_id: IssueId,
    pub project_id: ProjectId,
    pub old_version: Version,
    pub new_version: Version,
    pub old_fields: IssueFields,
    pub new_fields: IssueFields,
}

/// An issue removal. `version` is the issue's last token before deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueDeleted {
    pub issue_id: IssueId,
    pub project_id: ProjectId,
    pub version: Version,
    pub fields: IssueFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentChanged {
    pub project_id: ProjectId,
    pub user_name: UserName,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub user_name: UserName,
    pub initial_version: Version,
    pub fields: UserFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdated {
    pub user_name: UserName,
    pub old_version: Version,
    pub new_version: Version,
    pub old_fields: UserFields,
    pub new_fields: UserFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleted {
    pub user_name: UserName,
    pub version: Version,
    pub fields: UserFields,
}

// =============================================================================
// Domain Events
// =============================================================================

/// Every event the projection consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ProjectCreated(ProjectCreated),
    ProjectDeleted(ProjectDeleted),
    IssueCreated(IssueCreated),
    IssueUpdated(IssueUpdated),
    IssueDeleted(IssueDeleted),
    AssignmentCreated(AssignmentChanged),
    AssignmentDeleted(AssignmentChanged),
    UserCreated(UserCreated),
    UserUpdated(UserUpdated),
    UserDeleted(UserDeleted),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ProjectCreated(_) => EventKind::ProjectCreated,
            Self::ProjectDeleted(_) => EventKind::ProjectDeleted,
            Self::IssueCreated(_) => EventKind::IssueCreated,
            Self::IssueUpdated(_) => EventKind::IssueUpdated,
            Self::IssueDeleted(_) => EventKind::IssueDeleted,
            Self::AssignmentCreated(_) => EventKind::AssignmentCreated,
            Self::AssignmentDeleted(_) => EventKind::AssignmentDeleted,
            Self::UserCreated(_) => EventKind::UserCreated,
            Self::UserUpdated(_) => EventKind::UserUpdated,
            Self::UserDeleted(_) => EventKind::UserDeleted,
        }
    }

    /// Aggregate the event belongs to, e.g. `issue:42`. Used for log fields
    /// and bus affinity.
    pub fn aggregate_key(&self) -> String {
        match self {
            Self::ProjectCreated(e) => format!("project:{}", e.project_id),
            Self::ProjectDeleted(e) => format!("project:{}", e.project_id),
            Self::IssueCreated(e) => format!("issue:{}", e.issue_id),
            Self::IssueUpdated(e) => format!("issue:{}", e.issue_id),
            Self::IssueDeleted(e) => format!("issue:{}", e.issue_id),
            Self::AssignmentCreated(e) | Self::AssignmentDeleted(e) => {
                format!("assignment:{}/{}", e.project_id, e.user_name)
            }
            Self::UserCreated(e) => format!("user:{}", e.user_name),
            Self::UserUpdated(e) => format!("user:{}", e.user_name),
            Self::UserDeleted(e) => format!("user:{}", e.user_name),
        }
    }

    /// Project the event touches, if any.
    pub fn project_id(&self) -> Option<&ProjectId> {
        match self {
            Self::ProjectCreated(e) => Some(&e.project_id),
            Self::ProjectDeleted(e) => Some(&e.project_id),
            Self::IssueCreated(e) => Some(&e.project_id),
            Self::IssueUpdated(e) => Some(&e.project_id),
            Self::IssueDeleted(e) => Some(&e.project_id),
            Self::AssignmentCreated(e) | Self::AssignmentDeleted(e) => Some(&e.project_id),
            Self::UserCreated(_) | Self::UserUpdated(_) | Self::UserDeleted(_) => None,
        }
    }

    /// Reject events that cannot come from a well-behaved producer.
    ///
    /// Every mutation mints a fresh token, so an update that keeps its own
    /// version would pass the version check again on every redelivery.
    pub fn validate(&self) -> Result<()> {
        let reused = match self {
            Self::IssueUpdated(e) => (e.old_version == e.new_version).then(|| e.issue_id.to_string()),
            Self::UserUpdated(e) => (e.old_version == e.new_version).then(|| e.user_name.to_string()),
            _ => None,
        };
        match reused {
            Some(aggregate) => Err(TallyError::malformed_event(format!(
                "{} update reuses version token of {}",
                self.kind(),
                aggregate
            ))),
            None => Ok(()),
        }
    }

    /// User the event touches, if any.
    pub fn user_name(&self) -> Option<&UserName> {
        match self {
            Self::AssignmentCreated(e) | Self::AssignmentDeleted(e) => Some(&e.user_name),
            Self::UserCreated(e) => Some(&e.user_name),
            Self::UserUpdated(e) => Some(&e.user_name),
            Self::UserDeleted(e) => Some(&e.user_name),
            _ => None,
        }
    }
}

// =============================================================================
// Event Kinds
// =============================================================================

/// Discriminant of [`DomainEvent`]; one bus queue per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProjectCreated,
    ProjectDeleted,
    IssueCreated,
    IssueUpdated,
    IssueDeleted,
    AssignmentCreated,
    AssignmentDeleted,
    UserCreated,
    UserUpdated,
    UserDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::ProjectCreated,
        EventKind::ProjectDeleted,
        EventKind::IssueCreated,
        EventKind::IssueUpdated,
        EventKind::IssueDeleted,
        EventKind::AssignmentCreated,
        EventKind::AssignmentDeleted,
        EventKind::UserCreated,
        EventKind::UserUpdated,
        EventKind::UserDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::ProjectDeleted => "project_deleted",
            Self::IssueCreated => "issue_created",
            Self::IssueUpdated => "issue_updated",
            Self::IssueDeleted => "issue_deleted",
            Self::AssignmentCreated => "assignment_created",
            Self::AssignmentDeleted => "assignment_deleted",
            Self::UserCreated => "user_created",
            Self::UserUpdated => "user_updated",
            Self::UserDeleted => "user_deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                TallyError::new(ErrorCode::UnknownEventKind, format!("Unknown event kind: {}", s))
            })
    }
}

// =============================================================================
// Event Envelope
// =============================================================================

/// Transport wrapper around a [`DomainEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            event_id: EventId::new(),
            occurred_at: Utc::now(),
            correlation_id: None,
            event,
        }
    }

    /// Set the correlation ID.
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Parse a bus payload. Any decoding failure is a malformed event,
    /// including an unknown `type` tag, an invalid version token or an
    /// update that does not change its version.
    pub fn from_json(payload: &str) -> Result<Self> {
        let envelope: Self =
            serde_json::from_str(payload).map_err(|e| TallyError::malformed_event(e.to_string()))?;
        envelope.event.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<DomainEvent> for EventEnvelope {
    fn from(event: DomainEvent) -> Self {
        Self::new(event)
    }
}
