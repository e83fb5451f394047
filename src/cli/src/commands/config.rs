//! Configuration management commands.
//!
//! Stores CLI settings in `~/.tally/config.toml` and shows the engine
//! configuration the CLI resolves.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::context::Context as CliContext;
use crate::output::{self, OutputFormat};

/// Redis URL used instead of the engine configuration's.
pub const REDIS_URL: &str = "redis-url";
/// Engine configuration file loaded when `--config` is not given.
pub const CONFIG_FILE: &str = "config-file";

const KNOWN_KEYS: [&str; 2] = [REDIS_URL, CONFIG_FILE];

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a configuration value
    Set {
        /// Configuration key (redis-url, config-file)
        key: String,
        /// Value to set
        value: String,
    },

    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },

    /// Show all stored CLI values
    Show,

    /// Show the engine configuration in effect, credentials masked
    Effective,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

/// Persistent CLI configuration stored on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Return the path to the configuration file (`~/.tally/config.toml`).
fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".tally").join("config.toml"))
}

/// Load the CLI configuration from disk, returning defaults if the file does
/// not exist.
fn load_config() -> Result<CliConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}

/// Save the CLI configuration to disk, creating the directory if needed.
fn save_config(cfg: &CliConfig) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// A stored value, if set.
pub fn load_value(key: &str) -> Option<String> {
    load_config().ok().and_then(|cfg| cfg.values.get(key).cloned())
}

fn check_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!("Unknown key '{}' (expected one of: {})", key, KNOWN_KEYS.join(", "));
    }
    Ok(())
}

/// Mask credentials before a value is echoed back.
fn display_value(key: &str, value: &str) -> String {
    if key == REDIS_URL {
        tally_core::config::redact_url(value)
    } else {
        value.to_string()
    }
}

pub async fn execute(
    cmd: ConfigCommands,
    ctx: Result<CliContext>,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            check_key(&key)?;
            let mut cfg = load_config()?;
            cfg.values.insert(key.clone(), value.clone());
            save_config(&cfg)?;

            let shown = display_value(&key, &value);
            match format {
                OutputFormat::Table => output::print_success(&format!("{} = {}", key, shown)),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": shown }), format)?,
            }
        }

        ConfigCommands::Get { key } => {
            check_key(&key)?;
            let cfg = load_config()?;
            match cfg.values.get(&key) {
                Some(value) => {
                    let shown = display_value(&key, value);
                    match format {
                        OutputFormat::Table => println!("{}", shown),
                        _ => output::print_item(
                            &serde_json::json!({ "key": key, "value": shown }),
                            format,
                        )?,
                    }
                }
                None => bail!("Key '{}' not set", key),
            }
        }

        ConfigCommands::Show => {
            let cfg = load_config()?;

            if cfg.values.is_empty() {
                output::print_info("No configuration values set.");
                return Ok(());
            }

            let shown: BTreeMap<&String, String> = cfg
                .values
                .iter()
                .map(|(k, v)| (k, display_value(k, v)))
                .collect();
            match format {
                OutputFormat::Table => {
                    output::print_header("Configuration");
                    for (k, v) in &shown {
                        output::print_detail(k, v);
                    }
                }
                _ => output::print_item(&shown, format)?,
            }
        }

        ConfigCommands::Effective => {
            let ctx = ctx?;
            let effective = ctx.config.redacted();
            match format {
                OutputFormat::Table => {
                    print!("{}", toml::to_string_pretty(&effective)?);
                }
                _ => output::print_item(&effective, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This will reset all CLI configuration. Use --force to confirm.");
                return Ok(());
            }

            let path = config_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }

            output::print_success("Configuration reset to defaults");
        }
    }

    Ok(())
}
