//! Concurrent delivery of the same event against one store.
//!
//! Tests cover:
//! - Racing copies of an issue update move the counters once
//! - Racing copies of an issue create and delete
//! - Racing copies of an assignment add the member once

mod common;

use std::sync::Arc;

use common::*;
use tally_core::consumers::{Applied, ConsumeError};
use tally_core::error::ErrorCode;
use tally_core::events::{DomainEvent, EventEnvelope};
use tally_core::model::{IssuePriority, IssueStatus, IssueType};
use tally_core::version::Version;

const RACERS: usize = 16;

/// Dispatch `RACERS` copies of one envelope at once.
async fn race(h: &Harness, event: DomainEvent) -> Vec<Result<Applied, ConsumeError>> {
    let envelope = Arc::new(EventEnvelope::new(event));
    let barrier = Arc::new(tokio::sync::Barrier::new(RACERS));
    let tasks: Vec<_> = (0..RACERS)
        .map(|_| {
            let registry = h.registry.clone();
            let envelope = envelope.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                registry.dispatch(&envelope).await
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(RACERS);
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    outcomes
}

fn count_applied(outcomes: &[Result<Applied, ConsumeError>]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, Ok(Applied::Applied)))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_issue_updates_apply_once() {
    let h = Harness::new();
    let (v1, v2) = (Version::generate(), Version::generate());
    let closed = fields(IssueStatus::Closed, IssuePriority::Medium, IssueType::Bug);
    h.apply_ok(project_created("p1", Version::generate())).await;
    h.apply_ok(issue_created("i1", "p1", v1, open_bug())).await;

    let outcomes = race(&h, issue_updated("i1", "p1", (v1, open_bug()), (v2, closed))).await;

    assert_eq!(count_applied(&outcomes), 1);
    for outcome in &outcomes {
        assert!(matches!(outcome, Ok(Applied::Applied | Applied::Duplicate)), "{outcome:?}");
    }
    let counters = h.counters("p1").await;
    assert_eq!(counters.status[&IssueStatus::Open], 0);
    assert_eq!(counters.status[&IssueStatus::Closed], 1);
    assert_eq!(counters.tracked_issues, 1);
    assert!(counters.is_conserved());
    assert_eq!(h.reader.issue_version(&pid("p1"), &iid("i1")).await.unwrap(), Some(v2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_issue_creates_and_deletes_apply_once() {
    let h = Harness::new();
    let v1 = Version::generate();
    h.apply_ok(project_created("p1", Version::generate())).await;

    let created = race(&h, issue_created("i1", "p1", v1, open_bug())).await;
    assert_eq!(count_applied(&created), 1);
    assert!(created.iter().all(|o| o.is_ok()));
    assert_eq!(h.counters("p1").await.status[&IssueStatus::Open], 1);

    let deleted = race(&h, issue_deleted("i1", "p1", v1, open_bug())).await;
    assert_eq!(count_applied(&deleted), 1);
    assert!(deleted.iter().all(|o| o.is_ok()));
    let counters = h.counters("p1").await;
    assert_eq!(counters.status[&IssueStatus::Open], 0);
    assert_eq!(counters.tracked_issues, 0);
    assert!(counters.is_conserved());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_assignments_add_the_member_once() {
    let h = Harness::new();
    h.apply_ok(project_created("p1", Version::generate())).await;

    let outcomes = race(&h, assignment_created("p1", "alice")).await;

    assert_eq!(count_applied(&outcomes), 1);
    for outcome in outcomes.iter().filter(|o| !matches!(o, Ok(Applied::Applied))) {
        assert!(
            matches!(
                outcome,
                Err(ConsumeError::BusinessRule {
                    code: ErrorCode::MembershipViolation,
                    ..
                })
            ),
            "{outcome:?}"
        );
    }
    assert_eq!(h.reader.members(&pid("p1")).await.unwrap().len(), 1);
}
