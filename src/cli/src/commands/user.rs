//! User projection commands.

use anyhow::{bail, Result};
use clap::Subcommand;

use tally_core::model::UserName;

use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum UserCommands {
    /// Show the projected profile of a user
    Show {
        /// User name
        user_name: String,
    },
}

pub async fn execute(cmd: UserCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        UserCommands::Show { user_name } => {
            let user = UserName::new(user_name)?;
            let backend = ctx.connect().await?;
            let Some(view) = backend.reader.user(&user).await? else {
                bail!("User {} is not projected", user);
            };

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("User {}", view.username));
                    output::print_detail("Role", &view.role.to_string());
                    output::print_detail("Active", &output::yes_no(view.active));
                    output::print_detail("Deleted", &output::yes_no(view.deleted));
                    output::print_detail("Version", &view.version.to_string());
                }
                _ => output::print_item(&view, format)?,
            }
        }
    }
    Ok(())
}
