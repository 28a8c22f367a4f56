use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which detection rule raised a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// Too many requests of any kind in the detection window.
    Volume,
    /// Too many requests under one sensitive path prefix.
    SensitivePath,
    /// Too many hits on the login endpoint.
    LoginAttempts,
    /// Raised by an operator.
    Manual,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Volume => "volume",
            RuleCategory::SensitivePath => "sensitive_path",
            RuleCategory::LoginAttempts => "login_attempts",
            RuleCategory::Manual => "manual",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "volume" => Some(Self::Volume),
            "sensitive_path" => Some(Self::SensitivePath),
            "login_attempts" => Some(Self::LoginAttempts),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which existing unresolved flags suppress a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupScope {
    AnyCategory,
    /// Flags of `category`, plus sensitive-path flags whose prefix covers
    /// `path`.
    Path { category: RuleCategory, path: String },
}

impl DedupScope {
    pub fn covers(&self, category: RuleCategory, subject: Option<&str>) -> bool {
        match self {
            DedupScope::AnyCategory => true,
            DedupScope::Path { category: c, path } => {
                *c == category
                    || (category == RuleCategory::SensitivePath
                        && subject.is_some_and(|prefix| path.starts_with(prefix)))
            }
        }
    }
}

/// A suspicion record awaiting review or automatic escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspicionFlag {
    pub id: i64,
    pub address: IpAddr,
    pub category: RuleCategory,
    pub reason: String,
    /// Path or prefix the rule matched, for path-based rules.
    pub subject: Option<String>,
    pub flagged_at: DateTime<Utc>,
    pub request_count: u64,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Fields supplied when raising a flag; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFlag {
    pub address: IpAddr,
    pub category: RuleCategory,
    pub reason: String,
    pub subject: Option<String>,
    pub request_count: u64,
    pub flagged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trips_through_name() {
        for c in [
            RuleCategory::Volume,
            RuleCategory::SensitivePath,
            RuleCategory::LoginAttempts,
            RuleCategory::Manual,
        ] {
            assert_eq!(RuleCategory::from_str_name(c.as_str()), Some(c));
        }
        assert_eq!(RuleCategory::from_str_name("login"), None);
    }

    #[test]
    fn test_dedup_scope() {
        assert!(DedupScope::AnyCategory.covers(RuleCategory::Manual, None));
        assert!(DedupScope::AnyCategory.covers(RuleCategory::SensitivePath, Some("/admin")));
    }

    #[test]
    fn test_path_scope_covers_enclosing_prefix() {
        let scope = DedupScope::Path {
            category: RuleCategory::LoginAttempts,
            path: "/login".into(),
        };
        assert!(scope.covers(RuleCategory::LoginAttempts, Some("/login")));
        assert!(scope.covers(RuleCategory::SensitivePath, Some("/login")));
        assert!(scope.covers(RuleCategory::SensitivePath, Some("/log")));
        assert!(!scope.covers(RuleCategory::SensitivePath, Some("/admin")));
        assert!(!scope.covers(RuleCategory::SensitivePath, None));
        assert!(!scope.covers(RuleCategory::Volume, None));
        assert!(!scope.covers(RuleCategory::Manual, None));
    }
}
