use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A denylist entry. Entries are never physically removed; unblocking flips
/// `active` off so the history stays auditable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub address: IpAddr,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// Result of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
    Created,
    Reactivated,
    AlreadyBlocked,
}

impl BlockOutcome {
    /// True when the call turned a non-blocked address into a blocked one.
    pub fn changed(&self) -> bool {
        !matches!(self, BlockOutcome::AlreadyBlocked)
    }

    pub fn created(&self) -> bool {
        matches!(self, BlockOutcome::Created)
    }
}

impl fmt::Display for BlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockOutcome::Created => write!(f, "created"),
            BlockOutcome::Reactivated => write!(f, "reactivated"),
            BlockOutcome::AlreadyBlocked => write!(f, "already blocked"),
        }
    }
}

/// Result of an unblock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnblockOutcome {
    Unblocked,
    NotFound,
}

impl UnblockOutcome {
    pub fn found(&self) -> bool {
        matches!(self, UnblockOutcome::Unblocked)
    }
}
