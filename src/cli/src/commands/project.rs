//! Project projection commands.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use tally_core::model::{Bucket, ProjectId};
use tally_core::projection::{ProjectCounters, ProjectState, ProjectView};

use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Show the counters and members projected for a project
    Show {
        /// Project ID
        project_id: String,
    },
}

#[derive(Debug, Serialize, Tabled)]
pub struct CounterRow {
    #[tabled(rename = "Counter")]
    pub counter: &'static str,
    #[tabled(rename = "Bucket")]
    pub bucket: String,
    #[tabled(rename = "Issues")]
    pub count: u64,
}

/// One row per counter bucket, in bucket order.
pub fn counter_rows(counters: &ProjectCounters) -> Vec<CounterRow> {
    fn rows<B: Bucket + std::fmt::Display>(
        name: &'static str,
        counts: &std::collections::BTreeMap<B, u64>,
        out: &mut Vec<CounterRow>,
    ) {
        for bucket in B::ALL {
            out.push(CounterRow {
                counter: name,
                bucket: bucket.to_string(),
                count: counts.get(bucket).copied().unwrap_or(0),
            });
        }
    }

    let mut out = Vec::new();
    rows("status", &counters.status, &mut out);
    rows("priority", &counters.priority, &mut out);
    rows("type", &counters.issue_type, &mut out);
    out
}

/// Print one project view in table form.
pub fn print_project_table(view: &ProjectView) {
    output::print_header(&format!("Project {}", view.project_id));
    output::print_detail("Tracked issues", &view.counters.tracked_issues.to_string());
    output::print_detail("Conserved", &output::yes_no(view.counters.is_conserved()));
    let members: Vec<&str> = view.members.iter().map(|m| m.as_str()).collect();
    output::print_detail(
        "Members",
        &if members.is_empty() {
            "-".to_string()
        } else {
            members.join(", ")
        },
    );
    println!();
    println!("{}", output::render_table(&counter_rows(&view.counters)));
}

pub async fn execute(cmd: ProjectCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        ProjectCommands::Show { project_id } => {
            let project = ProjectId::new(project_id)?;
            let backend = ctx.connect().await?;
            let Some(view) = backend.reader.project(&project).await? else {
                match backend.reader.project_state(&project).await? {
                    ProjectState::Deleted => {
                        bail!("Project {} is deleted and waiting for its grace expiry", project)
                    }
                    _ => bail!("Project {} is not projected", project),
                }
            };

            match format {
                OutputFormat::Table => print_project_table(&view),
                _ => output::print_item(&view, format)?,
            }
            if !view.counters.is_conserved() {
                output::print_warning("Counters do not sum to the number of tracked issues");
            }
        }
    }
    Ok(())
}
