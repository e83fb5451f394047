//! Event publishing and dry-run replay.
//!
//! Event files are JSON Lines: one `EventEnvelope` per line, blank lines and
//! lines starting with `#` ignored.

use anyhow::{Context as _, Result};
use clap::Subcommand;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;

use tally_core::bus::{InMemoryBus, MessageBus};
use tally_core::config::Config;
use tally_core::consumers::ConsumerRegistry;
use tally_core::delivery::{BackoffStrategy, DeadLetterSink, InMemoryDeadLetters, RetryPolicy};
use tally_core::events::{EventEnvelope, EventKind};
use tally_core::model::{ProjectId, UserName};
use tally_core::projection::{ProjectView, ProjectionReader, UserView};
use tally_core::store::InMemoryStore;
use tally_core::worker::ConsumerWorker;

use crate::commands::dead_letters::DeadLetterRow;
use crate::commands::project::print_project_table;
use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum EventCommands {
    /// Publish every event of a JSONL file to the bus
    Publish {
        /// Path to the JSONL file
        file: PathBuf,
    },

    /// Apply a JSONL file to an in-memory projection and print the result
    Replay {
        /// Path to the JSONL file
        file: PathBuf,

        /// Delivery attempts per event before it is dead-lettered
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

/// Parse JSONL content into envelopes, failing on the first bad line.
pub fn parse_events(content: &str) -> Result<Vec<EventEnvelope>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            EventEnvelope::from_json(line).with_context(|| format!("Line {}", index + 1))
        })
        .collect()
}

fn read_events(path: &Path) -> Result<Vec<EventEnvelope>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_events(&content).with_context(|| format!("Invalid event in {}", path.display()))
}

/// Outcome of a dry-run replay.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub events: usize,
    pub deliveries: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub projects: Vec<ProjectView>,
    pub users: Vec<UserView>,
    pub dead_letters: Vec<DeadLetterRow>,
}

impl ReplayReport {
    /// Whether every replayed project's counters are conserved.
    pub fn is_conserved(&self) -> bool {
        self.projects.iter().all(|p| p.counters.is_conserved())
    }
}

#[derive(Debug, Serialize, Tabled)]
struct SummaryRow {
    #[tabled(rename = "Events")]
    events: usize,
    #[tabled(rename = "Deliveries")]
    deliveries: u64,
    #[tabled(rename = "Applied")]
    applied: u64,
    #[tabled(rename = "Duplicates")]
    duplicates: u64,
    #[tabled(rename = "Retried")]
    retried: u64,
    #[tabled(rename = "Dead-lettered")]
    dead_lettered: u64,
}

/// Apply `envelopes` to a fresh in-memory projection until no delivery is
/// left, retrying premature events without delay.
pub async fn replay(
    envelopes: &[EventEnvelope],
    config: &Config,
    max_attempts: u32,
) -> Result<ReplayReport> {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let dead_letters = Arc::new(InMemoryDeadLetters::new(config.bus.dead_letter_max));
    let registry = Arc::new(ConsumerRegistry::with_defaults(
        config.store.consumer_context(store.clone()),
    ));
    let retry = RetryPolicy::with_attempts(max_attempts)
        .with_backoff(BackoffStrategy::fixed(Duration::ZERO));

    for envelope in envelopes {
        bus.publish_event(envelope).await?;
    }

    let workers: Vec<ConsumerWorker> = EventKind::ALL
        .iter()
        .map(|kind| {
            ConsumerWorker::new(*kind, bus.clone(), registry.clone(), dead_letters.clone())
                .with_retry_policy(retry.clone())
        })
        .collect();

    loop {
        let mut handled = 0;
        for worker in &workers {
            handled += worker.drain().await?;
        }
        if handled == 0 {
            break;
        }
    }

    let reader = ProjectionReader::new(store, config.store.key_builder());
    let project_ids: BTreeSet<&ProjectId> =
        envelopes.iter().filter_map(|e| e.event.project_id()).collect();
    let user_names: BTreeSet<&UserName> =
        envelopes.iter().filter_map(|e| e.event.user_name()).collect();

    let mut projects = Vec::new();
    for id in project_ids {
        if let Some(view) = reader.project(id).await? {
            projects.push(view);
        }
    }
    let mut users = Vec::new();
    for name in user_names {
        if let Some(view) = reader.user(name).await? {
            users.push(view);
        }
    }

    let stat = |f: fn(&ConsumerWorker) -> u64| workers.iter().map(f).sum::<u64>();
    Ok(ReplayReport {
        events: envelopes.len(),
        deliveries: stat(|w| w.stats().received()),
        applied: stat(|w| w.stats().applied()),
        duplicates: stat(|w| w.stats().duplicates()),
        retried: stat(|w| w.stats().retried()),
        dead_lettered: stat(|w| w.stats().dead_lettered()),
        projects,
        users,
        dead_letters: dead_letters
            .list(usize::MAX)
            .await?
            .iter()
            .map(DeadLetterRow::from)
            .collect(),
    })
}

fn print_replay_table(report: &ReplayReport) {
    output::print_header("Replay");
    println!(
        "{}",
        output::render_table(&[SummaryRow {
            events: report.events,
            deliveries: report.deliveries,
            applied: report.applied,
            duplicates: report.duplicates,
            retried: report.retried,
            dead_lettered: report.dead_lettered,
        }])
    );

    for project in &report.projects {
        print_project_table(project);
    }

    if !report.users.is_empty() {
        output::print_header("Users");
        for user in &report.users {
            output::print_detail(
                user.username.as_str(),
                &format!(
                    "{} active={} deleted={}",
                    user.role, user.active, user.deleted
                ),
            );
        }
    }

    if !report.dead_letters.is_empty() {
        output::print_header("Dead letters");
        println!("{}", output::render_table(&report.dead_letters));
    }
}

pub async fn execute(cmd: EventCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        EventCommands::Publish { file } => {
            let envelopes = read_events(&file)?;
            let backend = ctx.connect().await?;
            for envelope in &envelopes {
                backend.bus.publish_event(envelope).await?;
            }
            output::print_success(&format!(
                "Published {} events from {}",
                envelopes.len(),
                file.display()
            ));
        }

        EventCommands::Replay { file, max_attempts } => {
            let envelopes = read_events(&file)?;
            let attempts = max_attempts.unwrap_or(ctx.config.retry.max_attempts).max(1);
            let report = replay(&envelopes, &ctx.config, attempts).await?;

            match format {
                OutputFormat::Table => print_replay_table(&report),
                _ => output::print_item(&report, format)?,
            }
            if report.is_conserved() {
                output::print_success("Counters are conserved");
            } else {
                output::print_warning("Counters do not sum to the number of tracked issues");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::events::{AssignmentChanged, DomainEvent, IssueCreated, ProjectCreated};
    use tally_core::model::{IssueFields, IssueId, IssuePriority, IssueStatus, IssueType};
    use tally_core::version::Version;

    fn jsonl(events: &[DomainEvent]) -> String {
        events
            .iter()
            .map(|e| EventEnvelope::new(e.clone()).to_json().unwrap())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_parse_events_skips_blank_and_comment_lines() {
        let event = DomainEvent::ProjectCreated(ProjectCreated {
            project_id: ProjectId::new("p1").unwrap(),
            initial_version: Version::generate(),
        });
        let content = format!("# seed\n\n{}\n", jsonl(&[event]));
        assert_eq!(parse_events(&content).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_events_reports_line() {
        let err = parse_events("\n{not json}\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Line 2"));
    }

    #[tokio::test]
    async fn test_replay_applies_out_of_order_events() {
        let project = ProjectId::new("p1").unwrap();
        let issue = DomainEvent::IssueCreated(IssueCreated {
            issue_id: IssueId::new("i1").unwrap(),
            project_id: project.clone(),
            initial_version: Version::generate(),
            fields: IssueFields::new(IssueStatus::Open, IssuePriority::High, IssueType::Bug),
        });
        let created = DomainEvent::ProjectCreated(ProjectCreated {
            project_id: project.clone(),
            initial_version: Version::generate(),
        });
        let assignment = DomainEvent::AssignmentCreated(AssignmentChanged {
            project_id: project.clone(),
            user_name: UserName::new("alice").unwrap(),
            version: Version::generate(),
        });

        // issue first, and twice: the duplicate must not count
        let envelopes = parse_events(&jsonl(&[
            issue.clone(),
            issue,
            assignment.clone(),
            assignment,
            created,
        ]))
        .unwrap();

        let report = replay(&envelopes, &Config::default(), 8).await.unwrap();
        assert_eq!(report.events, 5);
        assert_eq!(report.projects.len(), 1);
        let view = &report.projects[0];
        assert_eq!(view.counters.status[&IssueStatus::Open], 1);
        assert_eq!(view.counters.tracked_issues, 1);
        assert!(view.members.contains(&UserName::new("alice").unwrap()));
        assert!(report.is_conserved());
        assert_eq!(report.duplicates, 1);
        // the second assignment is a membership violation
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.dead_letters[0].reason, "business_rule");
    }
}
