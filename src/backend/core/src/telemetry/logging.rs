//! Structured logging for the consumer service and CLI.
//!
//! - JSON output for deployed consumers, pretty output for development
//! - Per-module levels layered over the global level
//! - Optional span lifecycle events (the `consume` span closes once per delivery)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// The `[logging]` section of the service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for everything without a module override
    pub level: String,
    pub format: LogFormat,
    /// e.g. `"tally_core::bus" = "debug"`
    pub module_levels: BTreeMap<String, String>,
    /// Source file and line of each event
    pub include_location: bool,
    pub include_thread: bool,
    /// Module path of each event
    pub include_target: bool,
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::Json,
            module_levels: BTreeMap::new(),
            include_location: false,
            include_thread: false,
            include_target: true,
            span_events: SpanEventConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// The global level followed by one directive per module.
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)?;
        for (module, level) in &self.module_levels {
            filter = filter.add_directive(format!("{}={}", module, level).parse()?);
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One object per line, for log shipping
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Span lifecycle events to log. All off by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub on_new: bool,
    pub on_enter: bool,
    pub on_exit: bool,
    /// Close events carry the span's busy/idle time
    pub on_close: bool,
}

impl SpanEventConfig {
    pub(crate) fn to_fmt_span(&self) -> FmtSpan {
        [
            (self.on_new, FmtSpan::NEW),
            (self.on_enter, FmtSpan::ENTER),
            (self.on_exit, FmtSpan::EXIT),
            (self.on_close, FmtSpan::CLOSE),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(FmtSpan::NONE, |acc, (_, event)| acc | event)
    }
}

/// Install the global subscriber.
///
/// In the `development` environment a JSON format is swapped for pretty
/// output. Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    let filter = config.env_filter()?;

    let format = if environment == "development" && config.format == LogFormat::Json {
        LogFormat::Pretty
    } else {
        config.format
    };

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(config.span_events.to_fmt_span())
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_ids(config.include_thread)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    tracing::debug!(level = %config.level, ?format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parses_lowercase() {
        let format: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(format, LogFormat::Compact);
        assert!(serde_json::from_str::<LogFormat>("\"Verbose\"").is_err());
    }

    #[test]
    fn test_span_events_to_fmt_span() {
        assert_eq!(SpanEventConfig::default().to_fmt_span(), FmtSpan::NONE);

        let config = SpanEventConfig {
            on_new: true,
            on_close: true,
            ..Default::default()
        };
        assert_eq!(config.to_fmt_span(), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_env_filter_accepts_module_levels() {
        let mut config = LoggingConfig {
            level: "warn".to_string(),
            ..Default::default()
        };
        config
            .module_levels
            .insert("tally_core::worker".to_string(), "debug".to_string());
        let filter = config.env_filter().unwrap();
        assert!(filter.to_string().contains("tally_core::worker=debug"));
    }

    #[test]
    fn test_env_filter_rejects_bad_directive() {
        let mut config = LoggingConfig::default();
        config
            .module_levels
            .insert("tally_core".to_string(), "loud".to_string());
        assert!(config.env_filter().is_err());
    }
}
