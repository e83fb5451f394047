//! Convergence tests: any delivery order of a valid history, with
//! duplicates, settles on the counters of in-order application.

mod common;

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use uuid::Uuid;

use common::*;
use tally_core::bus::{InMemoryBus, MessageBus};
use tally_core::consumers::Applied;
use tally_core::delivery::{BackoffStrategy, DeadLetterSink, InMemoryDeadLetters, RetryPolicy};
use tally_core::events::{DomainEvent, EventEnvelope, EventKind};
use tally_core::model::{Bucket, IssueFields, IssuePriority, IssueStatus, IssueType};
use tally_core::projection::ProjectCounters;
use tally_core::version::Version;
use tally_core::worker::ConsumerWorker;

// ============================================================================
// History Generation
// ============================================================================

/// The life of one issue: its fields after creation and after each update.
#[derive(Debug, Clone)]
struct IssuePlan {
    states: Vec<IssueFields>,
    deleted: bool,
}

fn version(n: u128) -> Version {
    Version::from_uuid(Uuid::from_u128(n))
}

fn fields_strategy() -> impl Strategy<Value = IssueFields> {
    (0..4usize, 0..4usize, 0..4usize).prop_map(|(s, p, t)| {
        IssueFields::new(IssueStatus::ALL[s], IssuePriority::ALL[p], IssueType::ALL[t])
    })
}

fn plan_strategy() -> impl Strategy<Value = IssuePlan> {
    (prop::collection::vec(fields_strategy(), 1..5), any::<bool>())
        .prop_map(|(states, deleted)| IssuePlan { states, deleted })
}

/// The events of `plans` in the order the write side emitted them.
fn history(plans: &[IssuePlan]) -> Vec<DomainEvent> {
    let mut events = vec![project_created("p1", version(1))];
    for (n, plan) in plans.iter().enumerate() {
        let issue = format!("i{n}");
        let base = 1_000 * (n as u128 + 1);

        events.push(issue_created(&issue, "p1", version(base), plan.states[0]));
        for (step, pair) in plan.states.windows(2).enumerate() {
            let old = (version(base + step as u128), pair[0]);
            let new = (version(base + step as u128 + 1), pair[1]);
            events.push(issue_updated(&issue, "p1", old, new));
        }
        if plan.deleted {
            let last = plan.states.len() - 1;
            events.push(issue_deleted(
                &issue,
                "p1",
                version(base + last as u128),
                plan.states[last],
            ));
        }
    }
    events
}

/// A history in emission order, and a shuffled delivery of it with some
/// events delivered more than once.
fn scenario() -> impl Strategy<Value = (Vec<DomainEvent>, Vec<DomainEvent>)> {
    prop::collection::vec(plan_strategy(), 1..4).prop_flat_map(|plans| {
        let ordered = history(&plans);
        let len = ordered.len();
        (Just(ordered), prop::collection::vec(0..len, 0..4)).prop_flat_map(|(ordered, dups)| {
            let mut delivered = ordered.clone();
            delivered.extend(dups.iter().map(|i| ordered[*i].clone()));
            (Just(ordered), Just(delivered).prop_shuffle())
        })
    })
}

// ============================================================================
// Drivers
// ============================================================================

async fn apply_in_order(events: &[DomainEvent]) -> ProjectCounters {
    let harness = Harness::new();
    for event in events {
        assert_eq!(harness.apply_ok(event.clone()).await, Applied::Applied);
    }
    harness.counters("p1").await
}

/// Publish `events` and drain every queue until nothing is left, retrying
/// premature deliveries without delay.
async fn deliver(events: &[DomainEvent]) -> (ProjectCounters, usize) {
    let harness = Harness::new();
    let bus = Arc::new(InMemoryBus::new());
    let dead_letters = Arc::new(InMemoryDeadLetters::new(100));
    let retry = RetryPolicy::with_attempts(64).with_backoff(BackoffStrategy::fixed(Duration::ZERO));

    for event in events {
        bus.publish_event(&EventEnvelope::new(event.clone()))
            .await
            .unwrap();
    }

    let workers: Vec<ConsumerWorker> = EventKind::ALL
        .iter()
        .map(|kind| {
            ConsumerWorker::new(
                *kind,
                bus.clone(),
                harness.registry.clone(),
                dead_letters.clone(),
            )
            .with_retry_policy(retry.clone())
        })
        .collect();

    loop {
        let mut handled = 0;
        for worker in &workers {
            handled += worker.drain().await.unwrap();
        }
        if handled == 0 {
            break;
        }
    }

    (
        harness.counters("p1").await,
        dead_letters.len().await.unwrap(),
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_any_delivery_order_converges((ordered, delivered) in scenario()) {
        let rt = runtime();
        let expected = rt.block_on(apply_in_order(&ordered));
        let (actual, dead) = rt.block_on(deliver(&delivered));

        prop_assert_eq!(dead, 0);
        prop_assert!(actual.is_conserved());
        prop_assert_eq!(actual, expected);
    }
}

#[tokio::test]
async fn test_reversed_history_converges() {
    let plans = vec![
        IssuePlan {
            states: vec![
                open_bug(),
                fields(IssueStatus::InProgress, IssuePriority::High, IssueType::Bug),
                fields(IssueStatus::Closed, IssuePriority::High, IssueType::Bug),
            ],
            deleted: false,
        },
        IssuePlan {
            states: vec![fields(IssueStatus::Open, IssuePriority::Low, IssueType::Task)],
            deleted: true,
        },
    ];
    let ordered = history(&plans);
    let mut reversed = ordered.clone();
    reversed.reverse();

    let expected = apply_in_order(&ordered).await;
    let (actual, dead) = deliver(&reversed).await;

    assert_eq!(dead, 0);
    assert_eq!(actual, expected);
    assert_eq!(actual.tracked_issues, 1);
    assert_eq!(actual.status[&IssueStatus::Closed], 1);
    assert_eq!(actual.issue_type[&IssueType::Task], 0);
}
