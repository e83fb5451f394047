//! Projection key layout.
//!
//! Every key of one aggregate shares a Redis hash tag (`{project:<id>}` or
//! `{user:<name>}`) so a transaction touching a single aggregate stays in
//! one cluster slot.

use crate::model::{IssueId, ProjectId, UserName};
use crate::version::Version;

/// Field names inside the user profile hash.
pub mod user_field {
    pub const USERNAME: &str = "username";
    pub const ROLE: &str = "role";
    pub const ACTIVE: &str = "active";
    pub const VERSION: &str = "version";
    pub const DELETED: &str = "deleted";
}

/// Which issue counter a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Status,
    Priority,
    Type,
}

impl Counter {
    pub const ALL: [Counter; 3] = [Counter::Status, Counter::Priority, Counter::Type];

    fn segment(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Type => "type",
        }
    }
}

/// Builds namespaced projection keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("tally:")
    }
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn project(&self, project: &ProjectId, segment: &str) -> String {
        format!("{}{{project:{}}}:{}", self.prefix, project, segment)
    }

    fn user(&self, user: &UserName, segment: &str) -> String {
        format!("{}{{user:{}}}:{}", self.prefix, user, segment)
    }

    /// String key whose presence marks the project as projected.
    pub fn project_exists(&self, project: &ProjectId) -> String {
        self.project(project, "exists")
    }

    /// String key holding the version of the applied `ProjectDeleted`. Its
    /// presence means the project is in its grace period.
    pub fn project_deleted(&self, project: &ProjectId) -> String {
        self.project(project, "deleted")
    }

    /// Hash of bucket code to issue count.
    pub fn counter(&self, project: &ProjectId, counter: Counter) -> String {
        self.project(project, counter.segment())
    }

    /// Hash of issue id to last applied version.
    pub fn issue_versions(&self, project: &ProjectId) -> String {
        self.project(project, "issue-version")
    }

    /// Set of member user names.
    pub fn members(&self, project: &ProjectId) -> String {
        self.project(project, "members")
    }

    /// Set of every `issue/version` pair ever applied in the project.
    ///
    /// Grows by one member per applied issue mutation (the issue id plus a
    /// 36 character token) and is only reclaimed with the whole project.
    /// Entries of deleted issues are kept so late duplicates of their
    /// events still classify as duplicates.
    pub fn applied_issue_versions(&self, project: &ProjectId) -> String {
        self.project(project, "applied")
    }

    /// Every key owned by a project projection.
    pub fn project_keys(&self, project: &ProjectId) -> Vec<String> {
        let mut keys = vec![self.project_exists(project), self.project_deleted(project)];
        keys.extend(Counter::ALL.iter().map(|c| self.counter(project, *c)));
        keys.push(self.issue_versions(project));
        keys.push(self.members(project));
        keys.push(self.applied_issue_versions(project));
        keys
    }

    /// Hash holding the user projection.
    pub fn user_profile(&self, user: &UserName) -> String {
        self.user(user, "profile")
    }

    /// Set of every version ever applied to a user.
    pub fn applied_user_versions(&self, user: &UserName) -> String {
        self.user(user, "applied")
    }

    pub fn user_keys(&self, user: &UserName) -> Vec<String> {
        vec![self.user_profile(user), self.applied_user_versions(user)]
    }
}

/// Member recorded in a project's applied set for an issue version.
pub fn applied_issue_member(issue: &IssueId, version: &Version) -> String {
    format!("{}/{}", issue, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_keys_share_a_hash_tag() {
        let keys = KeyBuilder::default();
        let p = ProjectId::new("p1").unwrap();

        assert_eq!(keys.project_exists(&p), "tally:{project:p1}:exists");
        assert_eq!(keys.counter(&p, Counter::Status), "tally:{project:p1}:status");
        for key in keys.project_keys(&p) {
            assert!(key.starts_with("tally:{project:p1}:"), "{key}");
        }
        assert_eq!(keys.project_keys(&p).len(), 8);
    }

    #[test]
    fn test_custom_prefix_is_applied() {
        let keys = KeyBuilder::new("test:");
        let u = UserName::new("alice").unwrap();
        assert_eq!(keys.user_profile(&u), "test:{user:alice}:profile");
    }
}
