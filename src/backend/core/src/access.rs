//! Access derivation over the projection.
//!
//! Answers "can user U act on project P" from the user profile and the
//! project's member set. Pure reads; a stale projection yields a stale
//! answer, never a write.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::{ProjectId, RoleCode, UserName};
use crate::projection::{ProjectState, ProjectionReader};

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum AccessDecision {
    /// The action is allowed.
    Allow,
    /// The action is denied, with a reason.
    Deny(String),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Deny(_))
    }
}

/// Derives access decisions from projected users and memberships.
#[derive(Clone)]
pub struct AccessResolver {
    reader: ProjectionReader,
}

impl AccessResolver {
    pub fn new(reader: ProjectionReader) -> Self {
        Self { reader }
    }

    /// Decide whether `user` may act on `project`.
    pub async fn can_act(&self, user: &UserName, project: &ProjectId) -> Result<AccessDecision> {
        let Some(view) = self.reader.user(user).await? else {
            return Ok(AccessDecision::Deny(format!("User {} is unknown", user)));
        };
        if view.deleted {
            return Ok(AccessDecision::Deny(format!("User {} is deleted", user)));
        }
        if !view.active {
            return Ok(AccessDecision::Deny(format!("User {} is inactive", user)));
        }
        match self.reader.project_state(project).await? {
            ProjectState::Live => {}
            ProjectState::Absent => {
                return Ok(AccessDecision::Deny(format!("Project {} is unknown", project)));
            }
            ProjectState::Deleted => {
                return Ok(AccessDecision::Deny(format!("Project {} is deleted", project)));
            }
        }

        if view.role == RoleCode::Admin {
            debug!(user = %user, project = %project, "Access granted by role");
            return Ok(AccessDecision::Allow);
        }
        if self.reader.is_member(project, user).await? {
            debug!(user = %user, project = %project, "Access granted by membership");
            return Ok(AccessDecision::Allow);
        }

        Ok(AccessDecision::Deny(format!(
            "User {} is not a member of project {}",
            user, project
        )))
    }

    /// Role of a live user; `None` if unknown or deleted.
    pub async fn role_of(&self, user: &UserName) -> Result<Option<RoleCode>> {
        Ok(self
            .reader
            .user(user)
            .await?
            .filter(|view| !view.deleted)
            .map(|view| view.role))
    }

    /// The subset of `candidates` that `user` may act on, in input order.
    pub async fn projects_visible(
        &self,
        user: &UserName,
        candidates: &[ProjectId],
    ) -> Result<Vec<ProjectId>> {
        let mut visible = Vec::new();
        for project in candidates {
            if self.can_act(user, project).await?.is_allowed() {
                visible.push(project.clone());
            }
        }
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumers::{ConsumerContext, ConsumerRegistry};
    use crate::events::{
        AssignmentChanged, DomainEvent, ProjectCreated, ProjectDeleted, UserCreated, UserDeleted,
    };
    use crate::model::UserFields;
    use crate::store::{InMemoryStore, KeyBuilder};
    use crate::version::Version;
    use std::sync::Arc;

    struct Fixture {
        registry: ConsumerRegistry,
        resolver: AccessResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let registry = ConsumerRegistry::with_defaults(ConsumerContext::new(store.clone()));
            let reader = ProjectionReader::new(store, KeyBuilder::default());
            Self {
                registry,
                resolver: AccessResolver::new(reader),
            }
        }

        async fn apply(&self, event: DomainEvent) {
            self.registry.dispatch(&event.into()).await.unwrap();
        }

        async fn user(&self, name: &str, role_code: RoleCode, active: bool) -> Version {
            let version = Version::generate();
            self.apply(DomainEvent::UserCreated(UserCreated {
                user_name: UserName::new(name).unwrap(),
                initial_version: version,
                fields: UserFields { role_code, active },
            }))
            .await;
            version
        }

        async fn project(&self, id: &str) {
            self.apply(DomainEvent::ProjectCreated(ProjectCreated {
                project_id: ProjectId::new(id).unwrap(),
                initial_version: Version::generate(),
            }))
            .await;
        }

        async fn assign(&self, project: &str, user: &str) {
            self.apply(DomainEvent::AssignmentCreated(AssignmentChanged {
                project_id: ProjectId::new(project).unwrap(),
                user_name: UserName::new(user).unwrap(),
                version: Version::generate(),
            }))
            .await;
        }
    }

    fn p(id: &str) -> ProjectId {
        ProjectId::new(id).unwrap()
    }

    fn u(name: &str) -> UserName {
        UserName::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_member_is_allowed_and_outsider_denied() {
        let fx = Fixture::new();
        fx.project("p1").await;
        fx.user("alice", RoleCode::Developer, true).await;
        fx.user("bob", RoleCode::Developer, true).await;
        fx.assign("p1", "alice").await;

        assert!(fx.resolver.can_act(&u("alice"), &p("p1")).await.unwrap().is_allowed());
        assert!(fx.resolver.can_act(&u("bob"), &p("p1")).await.unwrap().is_denied());
    }

    #[tokio::test]
    async fn test_admin_needs_no_membership_but_needs_a_project() {
        let fx = Fixture::new();
        fx.project("p1").await;
        fx.user("root", RoleCode::Admin, true).await;

        assert!(fx.resolver.can_act(&u("root"), &p("p1")).await.unwrap().is_allowed());
        assert!(fx.resolver.can_act(&u("root"), &p("p2")).await.unwrap().is_denied());
    }

    #[tokio::test]
    async fn test_unknown_inactive_and_deleted_users_are_denied() {
        let fx = Fixture::new();
        fx.project("p1").await;
        fx.user("idle", RoleCode::Admin, false).await;
        let v = fx.user("gone", RoleCode::Admin, true).await;
        fx.apply(DomainEvent::UserDeleted(UserDeleted {
            user_name: u("gone"),
            version: v,
            fields: UserFields {
                role_code: RoleCode::Admin,
                active: true,
            },
        }))
        .await;

        for name in ["nobody", "idle", "gone"] {
            let decision = fx.resolver.can_act(&u(name), &p("p1")).await.unwrap();
            assert!(decision.is_denied(), "{name}");
        }
        assert_eq!(fx.resolver.role_of(&u("gone")).await.unwrap(), None);
        assert_eq!(fx.resolver.role_of(&u("idle")).await.unwrap(), Some(RoleCode::Admin));
    }

    #[tokio::test]
    async fn test_deleted_project_denies_its_members() {
        let fx = Fixture::new();
        fx.project("p1").await;
        fx.user("bob", RoleCode::Developer, true).await;
        fx.user("root", RoleCode::Admin, true).await;
        fx.assign("p1", "bob").await;
        fx.apply(DomainEvent::ProjectDeleted(ProjectDeleted {
            project_id: p("p1"),
            version: Version::generate(),
        }))
        .await;

        for name in ["bob", "root"] {
            let decision = fx.resolver.can_act(&u(name), &p("p1")).await.unwrap();
            assert_eq!(decision, AccessDecision::Deny("Project p1 is deleted".to_string()));
        }
    }

    #[tokio::test]
    async fn test_projects_visible_filters_candidates() {
        let fx = Fixture::new();
        fx.project("p1").await;
        fx.project("p2").await;
        fx.user("alice", RoleCode::Viewer, true).await;
        fx.assign("p2", "alice").await;

        let visible = fx
            .resolver
            .projects_visible(&u("alice"), &[p("p1"), p("p2"), p("p3")])
            .await
            .unwrap();
        assert_eq!(visible, vec![p("p2")]);
    }
}
