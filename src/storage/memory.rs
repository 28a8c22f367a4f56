use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::models::block::{BlockEntry, BlockOutcome, UnblockOutcome};
use crate::models::flag::{DedupScope, NewFlag, SuspicionFlag};
use crate::models::request::RequestRecord;

use super::{BlockStore, FlagStore, LogStore, PathFilter, StoreResult};

struct FlagTable {
    rows: Vec<SuspicionFlag>,
    next_id: i64,
}

impl FlagTable {
    fn push(&mut self, flag: &NewFlag) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.rows.push(SuspicionFlag {
            id,
            address: flag.address,
            category: flag.category,
            reason: flag.reason.clone(),
            subject: flag.subject.clone(),
            flagged_at: flag.flagged_at,
            request_count: flag.request_count,
            resolved: false,
            resolved_at: None,
            notes: None,
        });
        id
    }
}

/// Process-local backend. Nothing survives a restart; used by tests and by
/// deployments that set `storage.backend = "memory"`.
pub struct MemoryStore {
    requests: RwLock<Vec<RequestRecord>>,
    blocks: DashMap<IpAddr, BlockEntry>,
    flags: Mutex<FlagTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(Vec::new()),
            blocks: DashMap::new(),
            flags: Mutex::new(FlagTable {
                rows: Vec::new(),
                next_id: 1,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryStore {
    fn append(&self, record: &RequestRecord) -> StoreResult<()> {
        self.requests.write().push(record.clone());
        Ok(())
    }

    fn count_by_address(
        &self,
        since: DateTime<Utc>,
        filter: &PathFilter,
    ) -> StoreResult<HashMap<IpAddr, u64>> {
        let requests = self.requests.read();
        let mut counts = HashMap::new();
        for r in requests
            .iter()
            .filter(|r| r.timestamp >= since && filter.matches(&r.path))
        {
            *counts.entry(r.address).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut requests = self.requests.write();
        let before = requests.len();
        requests.retain(|r| r.timestamp >= cutoff);
        Ok((before - requests.len()) as u64)
    }

    fn recent(&self, address: Option<IpAddr>, limit: usize) -> StoreResult<Vec<RequestRecord>> {
        let requests = self.requests.read();
        let mut out: Vec<RequestRecord> = requests
            .iter()
            .rev()
            .filter(|r| address.map_or(true, |a| r.address == a))
            .cloned()
            .collect();
        // Stable sort keeps insertion order (newest first) among equal timestamps.
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        Ok(out)
    }
}

impl BlockStore for MemoryStore {
    fn upsert_block(
        &self,
        address: IpAddr,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<BlockOutcome> {
        let outcome = match self.blocks.entry(address) {
            Entry::Vacant(slot) => {
                slot.insert(BlockEntry {
                    address,
                    reason: reason.to_string(),
                    created_at: now,
                    active: true,
                });
                BlockOutcome::Created
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.active {
                    BlockOutcome::AlreadyBlocked
                } else {
                    entry.active = true;
                    if !reason.is_empty() {
                        entry.reason = reason.to_string();
                    }
                    BlockOutcome::Reactivated
                }
            }
        };
        Ok(outcome)
    }

    fn deactivate(&self, address: IpAddr) -> StoreResult<UnblockOutcome> {
        match self.blocks.get_mut(&address) {
            Some(mut entry) => {
                entry.active = false;
                Ok(UnblockOutcome::Unblocked)
            }
            None => Ok(UnblockOutcome::NotFound),
        }
    }

    fn is_active(&self, address: IpAddr) -> StoreResult<bool> {
        Ok(self.blocks.get(&address).map_or(false, |e| e.active))
    }

    fn list_blocks(&self, only_active: bool) -> StoreResult<Vec<BlockEntry>> {
        let mut entries: Vec<BlockEntry> = self
            .blocks
            .iter()
            .filter(|e| !only_active || e.active)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}

impl FlagStore for MemoryStore {
    fn insert_flag_unless_recent(
        &self,
        flag: &NewFlag,
        since: DateTime<Utc>,
        scope: &DedupScope,
    ) -> StoreResult<Option<i64>> {
        let mut table = self.flags.lock();
        let suppressed = table.rows.iter().any(|f| {
            f.address == flag.address
                && !f.resolved
                && f.flagged_at >= since
                && scope.covers(f.category, f.subject.as_deref())
        });
        if suppressed {
            return Ok(None);
        }
        Ok(Some(table.push(flag)))
    }

    fn insert_flag(&self, flag: &NewFlag) -> StoreResult<i64> {
        Ok(self.flags.lock().push(flag))
    }

    fn unresolved_counts_since(&self, since: DateTime<Utc>) -> StoreResult<HashMap<IpAddr, u64>> {
        let table = self.flags.lock();
        let mut counts = HashMap::new();
        for f in table.rows.iter().filter(|f| !f.resolved && f.flagged_at >= since) {
            *counts.entry(f.address).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn resolve_all(
        &self,
        address: IpAddr,
        resolved_at: DateTime<Utc>,
        notes: &str,
    ) -> StoreResult<u64> {
        let mut table = self.flags.lock();
        let mut changed = 0;
        for f in table
            .rows
            .iter_mut()
            .filter(|f| f.address == address && !f.resolved)
        {
            f.resolved = true;
            f.resolved_at = Some(resolved_at);
            f.notes = Some(notes.to_string());
            changed += 1;
        }
        Ok(changed)
    }

    fn resolve_flag(
        &self,
        id: i64,
        resolved_at: DateTime<Utc>,
        notes: Option<&str>,
    ) -> StoreResult<bool> {
        let mut table = self.flags.lock();
        match table.rows.iter_mut().find(|f| f.id == id && !f.resolved) {
            Some(f) => {
                f.resolved = true;
                f.resolved_at = Some(resolved_at);
                if let Some(n) = notes {
                    f.notes = Some(n.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_flags(&self, resolved: Option<bool>, limit: usize) -> StoreResult<Vec<SuspicionFlag>> {
        let table = self.flags.lock();
        let mut out: Vec<SuspicionFlag> = table
            .rows
            .iter()
            .rev()
            .filter(|f| resolved.map_or(true, |r| f.resolved == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.flagged_at.cmp(&a.flagged_at));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flag::RuleCategory;
    use chrono::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_upsert_block_semantics() {
        let store = MemoryStore::new();
        let addr = ip("198.51.100.7");
        let now = Utc::now();

        assert_eq!(store.upsert_block(addr, "r1", now).unwrap(), BlockOutcome::Created);
        assert_eq!(
            store.upsert_block(addr, "r2", now).unwrap(),
            BlockOutcome::AlreadyBlocked
        );
        store.deactivate(addr).unwrap();
        assert_eq!(store.upsert_block(addr, "", now).unwrap(), BlockOutcome::Reactivated);
        assert_eq!(store.list_blocks(true).unwrap()[0].reason, "r1");
    }

    #[test]
    fn test_count_window_and_filter() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append(&RequestRecord::at(ip("1.1.1.1"), "/api/x", None, now))
            .unwrap();
        store
            .append(&RequestRecord::at(ip("1.1.1.1"), "/api/y", None, now - Duration::hours(3)))
            .unwrap();

        let counts = store
            .count_by_address(now - Duration::hours(1), &PathFilter::Prefix("/api".into()))
            .unwrap();
        assert_eq!(counts[&ip("1.1.1.1")], 1);
    }

    #[test]
    fn test_concurrent_flag_inserts_are_deduplicated() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let flag = NewFlag {
                        address: "5.5.5.5".parse().unwrap(),
                        category: RuleCategory::Volume,
                        reason: "burst".into(),
                        subject: None,
                        request_count: 500,
                        flagged_at: now,
                    };
                    store
                        .insert_flag_unless_recent(
                            &flag,
                            now - Duration::hours(24),
                            &DedupScope::AnyCategory,
                        )
                        .unwrap()
                })
            })
            .collect();

        let created = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(created, 1);
    }
}
