//! Dead-letter inspection and requeue.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;

use tally_core::bus::MessageBus;
use tally_core::delivery::{DeadLetterEntry, DeadLetterSink};

use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List dead-lettered deliveries, oldest first
    List {
        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Remove an entry and publish its payload again
    Requeue {
        /// Dead-letter entry ID
        id: Uuid,
    },
}

#[derive(Debug, Serialize, Tabled)]
pub struct DeadLetterRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Reason")]
    pub reason: String,
    #[tabled(rename = "Code")]
    pub code: String,
    #[tabled(rename = "Attempts")]
    pub attempts: u32,
    #[tabled(rename = "Dead-lettered")]
    pub dead_lettered_at: String,
    #[tabled(rename = "Message")]
    pub message: String,
}

impl From<&DeadLetterEntry> for DeadLetterRow {
    fn from(entry: &DeadLetterEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            kind: entry.kind.to_string(),
            reason: entry.reason.clone(),
            code: entry.error_code.to_string(),
            attempts: entry.attempts,
            dead_lettered_at: entry.dead_lettered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            message: entry.message.clone(),
        }
    }
}

pub async fn execute(cmd: DeadLetterCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    let backend = ctx.connect().await?;

    match cmd {
        DeadLetterCommands::List { limit } => {
            let entries = backend.dead_letters.list(limit).await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<DeadLetterRow> = entries.iter().map(DeadLetterRow::from).collect();
                    output::print_list(&rows, format)?;
                    let total = backend.dead_letters.len().await?;
                    if total > rows.len() {
                        output::print_info(&format!("Showing {} of {} entries", rows.len(), total));
                    }
                }
                _ => output::print_item(&entries, format)?,
            }
        }

        DeadLetterCommands::Requeue { id } => {
            let Some(entry) = backend.dead_letters.take(id).await? else {
                bail!("Dead letter {} not found", id);
            };
            if let Err(e) = backend.bus.publish(entry.kind, entry.payload.clone()).await {
                // put it back so the entry is not lost
                backend.dead_letters.push(entry).await?;
                return Err(e.into());
            }
            output::print_success(&format!("Requeued {} onto {}", id, entry.kind));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::consumers::ConsumeError;
    use tally_core::events::EventKind;

    #[test]
    fn test_row_from_entry() {
        let entry = DeadLetterEntry::new(
            EventKind::AssignmentCreated,
            "{}",
            1,
            Utc::now(),
            &ConsumeError::membership("alice is already a member of p1"),
        );
        let row = DeadLetterRow::from(&entry);
        assert_eq!(row.kind, "assignment_created");
        assert_eq!(row.reason, "business_rule");
        assert_eq!(row.code, "MembershipViolation");
        assert_eq!(row.attempts, 1);
    }
}
