//! Connection context shared by the commands.
//!
//! The engine configuration is resolved the same way the consumer service
//! resolves it (file, then `TALLY__*` environment variables); a Redis URL
//! given on the command line or stored in the CLI config wins over both.

use anyhow::{Context as _, Result};
use std::sync::Arc;

use tally_core::bus::RedisBus;
use tally_core::config::{redact_url, Config};
use tally_core::delivery::RedisDeadLetters;
use tally_core::projection::ProjectionReader;
use tally_core::store::{redis_store, RedisStore};

use crate::commands::config as cli_config;

/// Resolved settings for one CLI invocation.
pub struct Context {
    pub config: Config,
}

impl Context {
    pub fn load(config_file: Option<&str>, redis_url: Option<String>) -> Result<Self> {
        let config_file = config_file
            .map(str::to_string)
            .or_else(|| cli_config::load_value(cli_config::CONFIG_FILE));

        let mut config = match config_file.as_deref() {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path))?,
            None => Config::load().context("Failed to load configuration")?,
        };

        if let Some(url) = redis_url.or_else(|| cli_config::load_value(cli_config::REDIS_URL)) {
            config.redis.url = url;
        }
        Ok(Self { config })
    }

    /// Connect to the Redis deployment the consumers run against.
    pub async fn connect(&self) -> Result<Backend> {
        let conn = redis_store::connect(&self.config.redis)
            .await
            .with_context(|| format!("Failed to connect to {}", redact_url(&self.config.redis.url)))?;

        let store = Arc::new(RedisStore::new(conn.clone()));
        Ok(Backend {
            reader: ProjectionReader::new(store, self.config.store.key_builder()),
            bus: RedisBus::new(conn.clone(), self.config.bus.redis.clone()),
            dead_letters: RedisDeadLetters::new(
                conn,
                self.config.bus.dead_letter_key.clone(),
                self.config.bus.dead_letter_max,
            ),
        })
    }
}

/// Live handles on the deployed projection, bus and dead-letter list.
pub struct Backend {
    pub reader: ProjectionReader,
    pub bus: RedisBus,
    pub dead_letters: RedisDeadLetters,
}
