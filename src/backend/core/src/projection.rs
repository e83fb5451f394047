//! Typed, read-only views over the projection.
//!
//! Readers tolerate the staleness window of an eventually consistent view;
//! they never write. Values that cannot be decoded are reported as corrupt
//! rather than silently defaulted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{Result, TallyError};
use crate::model::{
    Bucket, IssueId, IssuePriority, IssueStatus, IssueType, ProjectId, RoleCode, UserName,
};
use crate::store::keys::user_field;
use crate::store::{Counter, KeyBuilder, ProjectionStore};
use crate::version::Version;

/// Issue counts of one project, per bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCounters {
    pub status: BTreeMap<IssueStatus, u64>,
    pub priority: BTreeMap<IssuePriority, u64>,
    #[serde(rename = "type")]
    pub issue_type: BTreeMap<IssueType, u64>,
    /// Issues currently tracked in the version map
    pub tracked_issues: u64,
}

impl ProjectCounters {
    pub fn status_total(&self) -> u64 {
        self.status.values().sum()
    }

    pub fn priority_total(&self) -> u64 {
        self.priority.values().sum()
    }

    pub fn type_total(&self) -> u64 {
        self.issue_type.values().sum()
    }

    /// Whether every counter sums to the number of tracked issues.
    pub fn is_conserved(&self) -> bool {
        let n = self.tracked_issues;
        self.status_total() == n && self.priority_total() == n && self.type_total() == n
    }
}

/// Projected state of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub username: UserName,
    pub role: RoleCode,
    pub active: bool,
    pub deleted: bool,
    pub version: Version,
}

/// Lifecycle position of a project projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    /// Never projected, or removed after its grace period.
    Absent,
    Live,
    /// `ProjectDeleted` applied; keys remain until the grace expiry.
    Deleted,
}

/// Everything projected for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectView {
    pub project_id: ProjectId,
    pub counters: ProjectCounters,
    pub members: BTreeSet<UserName>,
}

/// Reads typed views from a [`ProjectionStore`].
#[derive(Clone)]
pub struct ProjectionReader {
    store: Arc<dyn ProjectionStore>,
    keys: KeyBuilder,
}

impl ProjectionReader {
    pub fn new(store: Arc<dyn ProjectionStore>, keys: KeyBuilder) -> Self {
        Self { store, keys }
    }

    pub fn store(&self) -> &Arc<dyn ProjectionStore> {
        &self.store
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub async fn project_state(&self, project: &ProjectId) -> Result<ProjectState> {
        if !self.store.exists(&self.keys.project_exists(project)).await? {
            return Ok(ProjectState::Absent);
        }
        if self.store.exists(&self.keys.project_deleted(project)).await? {
            return Ok(ProjectState::Deleted);
        }
        Ok(ProjectState::Live)
    }

    /// Whether the project is projected and not deleted.
    pub async fn project_exists(&self, project: &ProjectId) -> Result<bool> {
        Ok(self.project_state(project).await? == ProjectState::Live)
    }

    /// Counters of a live project, or `None` if it is not projected or
    /// already deleted.
    pub async fn counters(&self, project: &ProjectId) -> Result<Option<ProjectCounters>> {
        if !self.project_exists(project).await? {
            return Ok(None);
        }
        let status_key = self.keys.counter(project, Counter::Status);
        let priority_key = self.keys.counter(project, Counter::Priority);
        let type_key = self.keys.counter(project, Counter::Type);

        let tracked = self
            .store
            .hash_get_all(&self.keys.issue_versions(project))
            .await?
            .len() as u64;

        Ok(Some(ProjectCounters {
            status: decode_counter(&status_key, self.store.hash_get_all(&status_key).await?)?,
            priority: decode_counter(&priority_key, self.store.hash_get_all(&priority_key).await?)?,
            issue_type: decode_counter(&type_key, self.store.hash_get_all(&type_key).await?)?,
            tracked_issues: tracked,
        }))
    }

    /// Last applied version of an issue.
    pub async fn issue_version(&self, project: &ProjectId, issue: &IssueId) -> Result<Option<Version>> {
        let key = self.keys.issue_versions(project);
        self.store
            .hash_get(&key, issue.as_str())
            .await?
            .map(|token| parse_version(&key, &token))
            .transpose()
    }

    pub async fn members(&self, project: &ProjectId) -> Result<BTreeSet<UserName>> {
        let key = self.keys.members(project);
        self.store
            .set_members(&key)
            .await?
            .into_iter()
            .map(|name| {
                UserName::new(name.clone()).map_err(|_| TallyError::corrupt_projection(&key, name))
            })
            .collect()
    }

    pub async fn is_member(&self, project: &ProjectId, user: &UserName) -> Result<bool> {
        self.store
            .set_contains(&self.keys.members(project), user.as_str())
            .await
    }

    /// Counters and members of a live project.
    pub async fn project(&self, project: &ProjectId) -> Result<Option<ProjectView>> {
        let Some(counters) = self.counters(project).await? else {
            return Ok(None);
        };
        Ok(Some(ProjectView {
            project_id: project.clone(),
            counters,
            members: self.members(project).await?,
        }))
    }

    /// Projected user, or `None` if unknown or fully expired.
    pub async fn user(&self, user: &UserName) -> Result<Option<UserView>> {
        let key = self.keys.user_profile(user);
        let profile = self.store.hash_get_all(&key).await?;
        if profile.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| {
            profile
                .get(name)
                .ok_or_else(|| TallyError::corrupt_projection(&key, format!("missing field {}", name)))
        };
        let role = field(user_field::ROLE)?;
        Ok(Some(UserView {
            username: user.clone(),
            role: RoleCode::from_code(role)
                .ok_or_else(|| TallyError::corrupt_projection(&key, format!("unknown role {}", role)))?,
            active: parse_flag(&key, field(user_field::ACTIVE)?)?,
            deleted: parse_flag(&key, field(user_field::DELETED)?)?,
            version: parse_version(&key, field(user_field::VERSION)?)?,
        }))
    }
}

fn decode_counter<B: Bucket>(key: &str, raw: HashMap<String, String>) -> Result<BTreeMap<B, u64>> {
    let mut counts: BTreeMap<B, u64> = B::ALL.iter().map(|b| (*b, 0)).collect();
    for (code, value) in raw {
        let bucket = B::from_code(&code)
            .ok_or_else(|| TallyError::corrupt_projection(key, format!("unknown bucket {}", code)))?;
        let count = value.parse::<u64>().map_err(|_| {
            TallyError::corrupt_projection(key, format!("bucket {} holds {}", code, value))
        })?;
        counts.insert(bucket, count);
    }
    Ok(counts)
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    raw.parse::<bool>()
        .map_err(|_| TallyError::corrupt_projection(key, format!("invalid flag {}", raw)))
}

fn parse_version(key: &str, raw: &str) -> Result<Version> {
    raw.parse::<Version>()
        .map_err(|_| TallyError::corrupt_projection(key, format!("invalid version {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::store::{InMemoryStore, Transaction};

    fn reader(store: Arc<InMemoryStore>) -> ProjectionReader {
        ProjectionReader::new(store, KeyBuilder::default())
    }

    #[tokio::test]
    async fn test_unknown_project_has_no_counters() {
        let reader = reader(Arc::new(InMemoryStore::new()));
        let project = ProjectId::new("nope").unwrap();
        assert!(reader.counters(&project).await.unwrap().is_none());
        assert!(reader.project(&project).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_counter_is_corrupt() {
        let store = Arc::new(InMemoryStore::new());
        store
            .commit(
                Transaction::new()
                    .set("tally:{project:p1}:exists", "v")
                    .hincr("tally:{project:p1}:status", "OPEN", -1),
            )
            .await
            .unwrap();

        let err = reader(store)
            .counters(&ProjectId::new("p1").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptProjection);
    }

    #[tokio::test]
    async fn test_missing_buckets_read_as_zero() {
        let store = Arc::new(InMemoryStore::new());
        store
            .commit(
                Transaction::new()
                    .set("tally:{project:p1}:exists", "v")
                    .hincr("tally:{project:p1}:status", "OPEN", 1)
                    .hset("tally:{project:p1}:issue-version", "i1", Version::generate().as_token()),
            )
            .await
            .unwrap();

        let counters = reader(store)
            .counters(&ProjectId::new("p1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counters.status[&IssueStatus::Open], 1);
        assert_eq!(counters.status[&IssueStatus::Closed], 0);
        assert_eq!(counters.tracked_issues, 1);
        assert!(!counters.is_conserved());
    }

    #[tokio::test]
    async fn test_deleted_project_is_hidden() {
        let store = Arc::new(InMemoryStore::new());
        store
            .commit(
                Transaction::new()
                    .set("tally:{project:p1}:exists", "v")
                    .hset("tally:{project:p1}:status", "OPEN", "0"),
            )
            .await
            .unwrap();
        let reader = reader(store.clone());
        let project = ProjectId::new("p1").unwrap();
        assert_eq!(reader.project_state(&project).await.unwrap(), ProjectState::Live);

        store
            .commit(Transaction::new().set("tally:{project:p1}:deleted", "v2"))
            .await
            .unwrap();
        assert_eq!(reader.project_state(&project).await.unwrap(), ProjectState::Deleted);
        assert!(!reader.project_exists(&project).await.unwrap());
        assert!(reader.counters(&project).await.unwrap().is_none());
        assert!(reader.project(&project).await.unwrap().is_none());
    }

    #[test]
    fn test_conservation_check() {
        let mut counters = ProjectCounters {
            tracked_issues: 2,
            ..Default::default()
        };
        counters.status.insert(IssueStatus::Open, 2);
        counters.priority.insert(IssuePriority::Low, 1);
        counters.priority.insert(IssuePriority::High, 1);
        counters.issue_type.insert(IssueType::Bug, 2);
        assert!(counters.is_conserved());

        counters.issue_type.insert(IssueType::Task, 1);
        assert!(!counters.is_conserved());
    }
}
