//! Domain vocabulary shared by events, consumers and read paths.
//!
//! Identifiers are thin newtypes over the write side's string ids. The issue
//! enumerations double as counter buckets: every variant has a stable wire
//! code that is used as the hash field name in the projection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, TallyError};

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> crate::error::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(TallyError::new(
                        ErrorCode::InvalidInput,
                        concat!($what, " must not be empty"),
                    ));
                }
                if id.contains(['{', '}']) {
                    return Err(TallyError::new(
                        ErrorCode::InvalidInput,
                        concat!($what, " must not contain braces"),
                    ));
                }
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = TallyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = TallyError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Identifier of a project aggregate.
    ProjectId,
    "project id"
);
string_id!(
    /// Identifier of an issue aggregate.
    IssueId,
    "issue id"
);
string_id!(
    /// Login name of a user aggregate.
    UserName,
    "user name"
);

// ═══════════════════════════════════════════════════════════════════════════════
// Counter Buckets
// ═══════════════════════════════════════════════════════════════════════════════

/// A closed enumeration whose variants are counter buckets.
pub trait Bucket: Copy + Eq + Ord + Sized + 'static {
    /// Every variant, in display order.
    const ALL: &'static [Self];

    /// Stable wire code stored as the hash field.
    fn code(&self) -> &'static str;

    /// Parse a wire code.
    fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.code() == code)
    }
}

macro_rules! bucket_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $code)]
                $variant,
            )+
        }

        impl Bucket for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn code(&self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.code())
            }
        }

        impl FromStr for $name {
            type Err = TallyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <Self as Bucket>::from_code(&s.to_ascii_uppercase()).ok_or_else(|| {
                    TallyError::new(
                        ErrorCode::InvalidInput,
                        format!(concat!("Unknown ", stringify!($name), ": {}"), s),
                    )
                })
            }
        }
    };
}

bucket_enum!(
    /// Workflow state of an issue.
    IssueStatus {
        Open => "OPEN",
        InProgress => "IN_PROGRESS",
        Resolved => "RESOLVED",
        Closed => "CLOSED",
    }
);

bucket_enum!(
    /// Priority of an issue.
    IssuePriority {
        Low => "LOW",
        Medium => "MEDIUM",
        High => "HIGH",
        Critical => "CRITICAL",
    }
);

bucket_enum!(
    /// Kind of an issue.
    IssueType {
        Bug => "BUG",
        Feature => "FEATURE",
        Task => "TASK",
        Improvement => "IMPROVEMENT",
    }
);

bucket_enum!(
    /// Role code carried by a user aggregate.
    RoleCode {
        Admin => "ADMIN",
        Manager => "MANAGER",
        Developer => "DEVELOPER",
        Viewer => "VIEWER",
    }
);

/// The projected fields of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueFields {
    pub status: IssueStatus,
    pub priority: IssuePriority,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
}

impl IssueFields {
    pub fn new(status: IssueStatus, priority: IssuePriority, issue_type: IssueType) -> Self {
        Self {
            status,
            priority,
            issue_type,
        }
    }
}

/// The projected fields of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFields {
    pub role_code: RoleCode,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_reject_empty_and_braces() {
        assert!(ProjectId::new("").is_err());
        assert!(ProjectId::new("  ").is_err());
        assert!(IssueId::new("a{b}").is_err());
        assert_eq!(UserName::new("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn test_bucket_codes_round_trip() {
        for status in IssueStatus::ALL {
            assert_eq!(IssueStatus::from_code(status.code()), Some(*status));
        }
        assert_eq!("in_progress".parse::<IssueStatus>().unwrap(), IssueStatus::InProgress);
        assert!("DONE".parse::<IssueStatus>().is_err());
    }

    #[test]
    fn test_issue_fields_use_wire_codes() {
        let fields = IssueFields::new(IssueStatus::Open, IssuePriority::High, IssueType::Bug);
        let json = serde_json::to_value(fields).unwrap();
        assert_eq!(json["status"], "OPEN");
        assert_eq!(json["priority"], "HIGH");
        assert_eq!(json["type"], "BUG");
    }
}
