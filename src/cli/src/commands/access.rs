//! Access derivation commands.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use serde::Serialize;

use tally_core::access::{AccessDecision, AccessResolver};
use tally_core::model::{ProjectId, UserName};

use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum AccessCommands {
    /// Check whether a user may act on a project
    Check {
        /// User name
        user_name: String,
        /// Project ID
        project_id: String,
    },
}

#[derive(Debug, Serialize)]
struct AccessReport {
    user: UserName,
    project: ProjectId,
    #[serde(flatten)]
    decision: AccessDecision,
}

pub async fn execute(cmd: AccessCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        AccessCommands::Check {
            user_name,
            project_id,
        } => {
            let user = UserName::new(user_name)?;
            let project = ProjectId::new(project_id)?;
            let backend = ctx.connect().await?;
            let decision = AccessResolver::new(backend.reader)
                .can_act(&user, &project)
                .await?;

            match format {
                OutputFormat::Table => match &decision {
                    AccessDecision::Allow => println!(
                        "{} {} may act on {}",
                        "ALLOW".green().bold(),
                        user,
                        project
                    ),
                    AccessDecision::Deny(reason) => {
                        println!("{} {}", "DENY".red().bold(), reason)
                    }
                },
                _ => output::print_item(
                    &AccessReport {
                        user,
                        project,
                        decision,
                    },
                    format,
                )?,
            }
        }
    }
    Ok(())
}
