//! Telemetry: structured logging and metric descriptions.
//!
//! - **Logging**: JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: names and descriptions of the counters and histograms the
//!   worker, consumers and error type record through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use tally_core::telemetry::{init_telemetry, LoggingConfig};
//!
//! init_telemetry(&LoggingConfig::default(), "production").expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use self::metrics::{describe_metrics, COMMIT_SECONDS, ERRORS_TOTAL, EVENTS_TOTAL};

/// Initialize logging and describe metrics. Call once at startup.
pub fn init_telemetry(logging: &LoggingConfig, environment: &str) -> anyhow::Result<()> {
    init_logging(logging, environment)?;
    describe_metrics();
    ::tracing::info!(environment, "Telemetry initialized");
    Ok(())
}
