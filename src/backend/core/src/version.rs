//! Version tokens for optimistic concurrency.
//!
//! Every mutation of an aggregate produces a fresh random token. Tokens are
//! compared for equality only: consumers never reason about which of two
//! tokens is "newer", so `Version` deliberately implements neither
//! `PartialOrd` nor `Ord`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorCode, TallyError};

/// Opaque per-mutation version token of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(Uuid);

impl Version {
    /// Mint a new token for a mutation.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Canonical string form, as stored in the projection.
    pub fn as_token(&self) -> String {
        self.0.as_hyphenated().to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for Version {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TallyError::new(ErrorCode::InvalidVersion, "Version token is empty"));
        }
        Uuid::parse_str(trimmed).map(Self).map_err(|e| {
            TallyError::with_internal(
                ErrorCode::InvalidVersion,
                format!("Version token is not a valid UUID: {}", trimmed),
                e.to_string(),
            )
        })
    }
}

impl TryFrom<String> for Version {
    type Error = TallyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.as_token()
    }
}
