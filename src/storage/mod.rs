//! Persistence seams for request logs, the denylist and suspicion flags.
//!
//! Each trait method is a single atomic unit against its backend. Callers
//! never hold a transaction across calls.

pub mod cache;
pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::block::{BlockEntry, BlockOutcome, UnblockOutcome};
use crate::models::flag::{DedupScope, NewFlag, SuspicionFlag};
use crate::models::request::RequestRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// `now - secs`, saturating at the earliest representable instant.
pub fn window_start(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Restricts a windowed count to a subset of paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFilter {
    Any,
    Prefix(String),
    Exact(String),
}

impl PathFilter {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::Any => true,
            PathFilter::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathFilter::Exact(exact) => path == exact,
        }
    }
}

/// Append-mostly time series of admitted requests.
pub trait LogStore: Send + Sync {
    fn append(&self, record: &RequestRecord) -> StoreResult<()>;

    /// Requests per address with `timestamp >= since` whose path passes `filter`.
    fn count_by_address(
        &self,
        since: DateTime<Utc>,
        filter: &PathFilter,
    ) -> StoreResult<HashMap<IpAddr, u64>>;

    /// Delete records with `timestamp < cutoff`. Returns the number removed.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Newest records first, optionally for one address.
    fn recent(&self, address: Option<IpAddr>, limit: usize) -> StoreResult<Vec<RequestRecord>>;
}

/// Authoritative denylist storage.
pub trait BlockStore: Send + Sync {
    /// Create, reactivate or leave alone the entry for `address`.
    /// A non-empty `reason` replaces the old one on reactivation.
    fn upsert_block(
        &self,
        address: IpAddr,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<BlockOutcome>;

    fn deactivate(&self, address: IpAddr) -> StoreResult<UnblockOutcome>;

    fn is_active(&self, address: IpAddr) -> StoreResult<bool>;

    /// Entries ordered newest first.
    fn list_blocks(&self, only_active: bool) -> StoreResult<Vec<BlockEntry>>;
}

/// Suspicion flag storage.
pub trait FlagStore: Send + Sync {
    /// Insert `flag` unless an unresolved flag for the same address, inside
    /// `scope`, was raised at or after `since`. Check and insert are atomic.
    /// Returns the new id, or `None` when suppressed.
    fn insert_flag_unless_recent(
        &self,
        flag: &NewFlag,
        since: DateTime<Utc>,
        scope: &DedupScope,
    ) -> StoreResult<Option<i64>>;

    /// Unconditional insert (operator flags).
    fn insert_flag(&self, flag: &NewFlag) -> StoreResult<i64>;

    /// Unresolved flags per address raised at or after `since`.
    fn unresolved_counts_since(&self, since: DateTime<Utc>) -> StoreResult<HashMap<IpAddr, u64>>;

    /// Resolve every unresolved flag of `address`. Returns how many changed.
    fn resolve_all(
        &self,
        address: IpAddr,
        resolved_at: DateTime<Utc>,
        notes: &str,
    ) -> StoreResult<u64>;

    /// Resolve one flag by id. Returns false when no such unresolved flag exists.
    fn resolve_flag(
        &self,
        id: i64,
        resolved_at: DateTime<Utc>,
        notes: Option<&str>,
    ) -> StoreResult<bool>;

    /// Flags ordered newest first, optionally filtered by resolution state.
    fn list_flags(&self, resolved: Option<bool>, limit: usize) -> StoreResult<Vec<SuspicionFlag>>;
}

/// A backend implementing all three stores.
pub trait Store: LogStore + BlockStore + FlagStore {}

impl<T: LogStore + BlockStore + FlagStore> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_filter() {
        assert!(PathFilter::Any.matches("/anything"));
        assert!(PathFilter::Prefix("/admin".into()).matches("/admin/users"));
        assert!(PathFilter::Prefix("/admin".into()).matches("/administrator"));
        assert!(!PathFilter::Prefix("/admin".into()).matches("/api"));
        assert!(PathFilter::Exact("/login".into()).matches("/login"));
        assert!(!PathFilter::Exact("/login".into()).matches("/login/"));
    }

    #[test]
    fn test_window_start_saturates() {
        let now = Utc::now();
        assert_eq!(window_start(now, 3_600), now - Duration::hours(1));
        assert_eq!(window_start(now, u64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(window_start(now, i64::MAX as u64), DateTime::<Utc>::MIN_UTC);
    }
}
