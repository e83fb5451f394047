//! Crate-wide error type.
//!
//! Every failure carries an [`ErrorCode`]. The code decides whether a
//! redelivery can help, how loudly the error is logged, and how it is
//! labelled in `tally_errors_total`. Dead-letter entries store the code
//! verbatim, so codes are never renamed.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

pub type Result<T> = std::result::Result<T, TallyError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Codes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // projection, 1000s
    ProjectNotProjected,
    VersionMismatch,
    MembershipViolation,
    AggregateConflict,
    CorruptProjection,

    // events, 1100s
    MalformedEvent,
    InvalidVersion,
    UnknownEventKind,

    // delivery, 1200s
    RetryBudgetExhausted,
    BusError,
    BusConnectionFailed,

    // store, 2100s
    StoreError,
    StoreConnectionFailed,
    StoreWrongType,

    // encoding, 2200s
    SerializationError,
    DeserializationError,

    InvalidInput,

    // configuration, 5000s
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    InternalError,
    UnknownError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ProjectNotProjected => 1000,
            Self::VersionMismatch => 1001,
            Self::MembershipViolation => 1002,
            Self::AggregateConflict => 1003,
            Self::CorruptProjection => 1004,

            Self::MalformedEvent => 1100,
            Self::InvalidVersion => 1101,
            Self::UnknownEventKind => 1102,

            Self::RetryBudgetExhausted => 1200,
            Self::BusError => 1201,
            Self::BusConnectionFailed => 1202,

            Self::StoreError => 2100,
            Self::StoreConnectionFailed => 2101,
            Self::StoreWrongType => 2102,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::InvalidInput => 4100,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Whether a later attempt of the same operation may succeed.
    ///
    /// A missing parent projection and a premature version are retryable:
    /// the event they wait for is still on its way.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotProjected
                | Self::VersionMismatch
                | Self::BusError
                | Self::BusConnectionFailed
                | Self::StoreError
                | Self::StoreConnectionFailed
        )
    }

    /// Metric and log label for the code's range.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "projection",
            1100..=1199 => "event",
            1200..=1299 => "delivery",
            2100..=2199 => "store",
            2200..=2299 => "encoding",
            4100..=4199 => "input",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How loudly an error is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected while deliveries arrive out of order
    Low,
    Medium,
    /// Needs a look upstream: the event stream or the projection is wrong
    High,
    /// Infrastructure unreachable
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ProjectNotProjected
            | ErrorCode::VersionMismatch
            | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::RetryBudgetExhausted
            | ErrorCode::BusError
            | ErrorCode::StoreError
            | ErrorCode::UnknownEventKind => Self::Medium,

            ErrorCode::MembershipViolation
            | ErrorCode::AggregateConflict
            | ErrorCode::CorruptProjection
            | ErrorCode::MalformedEvent
            | ErrorCode::InvalidVersion
            | ErrorCode::StoreWrongType
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::BusConnectionFailed
            | ErrorCode::StoreConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TallyError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct TallyError {
    code: ErrorCode,
    /// Safe to show to operators
    message: Cow<'static, str>,
    /// Low-level detail for logs, e.g. the driver's own message
    detail: Option<String>,
    /// Store key the error concerns
    key: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TallyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl TallyError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            detail: None,
            key: None,
            source: None,
        };
        counter!(
            crate::telemetry::ERRORS_TOTAL,
            "code" => error.code.to_string(),
            "category" => error.code.category(),
            "retryable" => if error.is_retryable() { "true" } else { "false" },
        )
        .increment(1);
        error
    }

    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        detail: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.detail = Some(detail.into());
        error
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "Internal error", detail)
    }

    pub fn malformed_event(detail: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::MalformedEvent, "Event payload is malformed", detail)
    }

    /// A stored value that cannot be decoded into its projected type.
    pub fn corrupt_projection(key: impl Into<String>, detail: impl Into<String>) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::CorruptProjection,
            format!("Projection key {} holds an unexpected value", key),
            detail,
        )
        .for_key(key)
    }

    pub fn wrong_type(key: impl Into<String>, expected: &'static str) -> Self {
        let key = key.into();
        Self::new(
            ErrorCode::StoreWrongType,
            format!("Key {} does not hold a {}", key, expected),
        )
        .for_key(key)
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn for_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Emit the error at the level its severity calls for.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let key = self.key.as_deref().unwrap_or("-");

        match self.severity() {
            ErrorSeverity::Critical => error!(
                error_code = %code,
                category,
                key,
                detail = ?self.detail,
                source = ?self.source,
                "{}",
                self.message
            ),
            ErrorSeverity::High => error!(
                error_code = %code,
                category,
                key,
                detail = ?self.detail,
                "{}",
                self.message
            ),
            ErrorSeverity::Medium => warn!(error_code = %code, category, key, "{}", self.message),
            ErrorSeverity::Low => debug!(error_code = %code, category, key, "{}", self.message),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for TallyError {
    fn from(error: redis::RedisError) -> Self {
        let (code, message) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Redis is unreachable")
        } else if error.kind() == redis::ErrorKind::TypeError || error.code() == Some("WRONGTYPE") {
            (ErrorCode::StoreWrongType, "Redis returned an unexpected type")
        } else if error.is_timeout() {
            (ErrorCode::StoreError, "Redis timed out")
        } else {
            (ErrorCode::StoreError, "Redis command failed")
        };

        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Invalid JSON", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for TallyError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::InvalidInput,
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                ErrorCode::StoreConnectionFailed
            }
            _ => ErrorCode::InternalError,
        };

        Self::with_internal(code, "I/O failure", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for TallyError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::NotFound(_) => ErrorCode::MissingConfiguration,
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::ConfigurationError,
        };

        Self::with_internal(code, "Configuration could not be loaded", error.to_string())
    }
}
