//! Tally CLI - operator tooling for the projection engine.
//!
//! Inspects projected projects and users, checks access, publishes or
//! dry-run replays event files, and manages dead letters.

mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{access, config, dead_letters, events, project, user};
use context::Context;
use output::OutputFormat;

/// Tally - projection consistency engine CLI
#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Tally - projection consistency engine",
    long_about = "Operator CLI for inspecting the issue tracker projection, replaying event files and managing dead letters.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Engine configuration file (TOML/YAML/JSON)
    #[arg(short, long, global = true, env = "TALLY_CONFIG")]
    config: Option<String>,

    /// Redis URL, overriding the configuration
    #[arg(long, global = true, env = "TALLY_REDIS_URL")]
    redis_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Projected project counters and members
    #[command(subcommand)]
    Project(project::ProjectCommands),

    /// Projected user profiles
    #[command(subcommand)]
    User(user::UserCommands),

    /// Access derivation
    #[command(subcommand)]
    Access(access::AccessCommands),

    /// Publish or replay event files
    #[command(subcommand)]
    Events(events::EventCommands),

    /// Inspect and requeue dead letters
    #[command(subcommand)]
    DeadLetters(dead_letters::DeadLetterCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

async fn run(cli: Cli) -> Result<()> {
    let format = cli.output;
    let ctx = Context::load(cli.config.as_deref(), cli.redis_url.clone());

    match cli.command {
        // config commands must work even when the engine config does not load
        Commands::Config(cmd) => config::execute(cmd, ctx, format).await,
        Commands::Project(cmd) => project::execute(cmd, &ctx?, format).await,
        Commands::User(cmd) => user::execute(cmd, &ctx?, format).await,
        Commands::Access(cmd) => access::execute(cmd, &ctx?, format).await,
        Commands::Events(cmd) => events::execute(cmd, &ctx?, format).await,
        Commands::DeadLetters(cmd) => dead_letters::execute(cmd, &ctx?, format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_nested_commands() {
        let cli = Cli::try_parse_from(["tally", "-o", "json", "access", "check", "alice", "p1"])
            .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Access(_)));

        let cli = Cli::try_parse_from(["tally", "dead-letters", "list", "--limit", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::DeadLetters(_)));
    }
}
