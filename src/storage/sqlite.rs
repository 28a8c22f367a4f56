use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::models::block::{BlockEntry, BlockOutcome, UnblockOutcome};
use crate::models::flag::{DedupScope, NewFlag, RuleCategory, SuspicionFlag};
use crate::models::request::RequestRecord;

use super::{BlockStore, FlagStore, LogStore, PathFilter, StoreError, StoreResult};

/// Fixed-width so lexical order in SQLite equals chronological order.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|n| n.and_utc())
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", s, e)))
}

fn parse_ip(s: &str) -> StoreResult<IpAddr> {
    IpAddr::from_str(s).map_err(|e| StoreError::Corrupt(format!("address {:?}: {}", s, e)))
}

struct RawRequest {
    ip: String,
    timestamp: String,
    path: String,
    country: Option<String>,
    city: Option<String>,
}

impl RawRequest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ip: row.get(0)?,
            timestamp: row.get(1)?,
            path: row.get(2)?,
            country: row.get(3)?,
            city: row.get(4)?,
        })
    }

    fn into_record(self) -> StoreResult<RequestRecord> {
        Ok(RequestRecord {
            address: parse_ip(&self.ip)?,
            timestamp: parse_ts(&self.timestamp)?,
            path: self.path,
            country: self.country,
            city: self.city,
        })
    }
}

struct RawBlock {
    ip: String,
    reason: String,
    created_at: String,
    active: bool,
}

impl RawBlock {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ip: row.get(0)?,
            reason: row.get(1)?,
            created_at: row.get(2)?,
            active: row.get::<_, i32>(3)? != 0,
        })
    }

    fn into_entry(self) -> StoreResult<BlockEntry> {
        Ok(BlockEntry {
            address: parse_ip(&self.ip)?,
            reason: self.reason,
            created_at: parse_ts(&self.created_at)?,
            active: self.active,
        })
    }
}

struct RawFlag {
    id: i64,
    ip: String,
    category: String,
    reason: String,
    flagged_at: String,
    request_count: i64,
    resolved: bool,
    resolved_at: Option<String>,
    notes: Option<String>,
    subject: Option<String>,
}

impl RawFlag {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ip: row.get(1)?,
            category: row.get(2)?,
            reason: row.get(3)?,
            flagged_at: row.get(4)?,
            request_count: row.get(5)?,
            resolved: row.get::<_, i32>(6)? != 0,
            resolved_at: row.get(7)?,
            notes: row.get(8)?,
            subject: row.get(9)?,
        })
    }

    fn into_flag(self) -> StoreResult<SuspicionFlag> {
        let category = RuleCategory::from_str_name(&self.category)
            .ok_or_else(|| StoreError::Corrupt(format!("flag category {:?}", self.category)))?;
        Ok(SuspicionFlag {
            id: self.id,
            address: parse_ip(&self.ip)?,
            category,
            reason: self.reason,
            subject: self.subject,
            flagged_at: parse_ts(&self.flagged_at)?,
            request_count: self.request_count.max(0) as u64,
            resolved: self.resolved,
            resolved_at: self.resolved_at.as_deref().map(parse_ts).transpose()?,
            notes: self.notes,
        })
    }
}

/// SQLite-backed implementation of every store trait.
///
/// One connection behind a mutex; multi-statement operations run inside an
/// immediate transaction so a second process (the CLI) cannot interleave.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn new(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS request_logs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                ip          TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                path        TEXT NOT NULL,
                country     TEXT,
                city        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_request_logs_ip ON request_logs(ip);

            CREATE TABLE IF NOT EXISTS blocked_ips (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                ip          TEXT NOT NULL,
                reason      TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL,
                is_active   INTEGER NOT NULL DEFAULT 1,
                UNIQUE(ip)
            );
            CREATE INDEX IF NOT EXISTS idx_blocked_ips_active ON blocked_ips(ip, is_active);

            CREATE TABLE IF NOT EXISTS suspicious_ips (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                ip              TEXT NOT NULL,
                category        TEXT NOT NULL,
                reason          TEXT NOT NULL,
                flagged_at      TEXT NOT NULL,
                request_count   INTEGER NOT NULL DEFAULT 0,
                is_resolved     INTEGER NOT NULL DEFAULT 0,
                resolved_at     TEXT,
                notes           TEXT,
                subject         TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_suspicious_ips_ip ON suspicious_ips(ip);
            CREATE INDEX IF NOT EXISTS idx_suspicious_ips_open ON suspicious_ips(is_resolved, flagged_at);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Rows removed per purge statement. The connection lock is released
/// between batches so request logging keeps flowing during a large purge.
const PURGE_BATCH: usize = 5_000;

impl SqliteStore {
    fn delete_in_batches(&self, cutoff: DateTime<Utc>, batch: usize) -> StoreResult<u64> {
        let cutoff = fmt_ts(cutoff);
        let mut total = 0u64;
        loop {
            let deleted = {
                let conn = self.conn.lock();
                conn.execute(
                    "DELETE FROM request_logs WHERE id IN
                        (SELECT id FROM request_logs WHERE timestamp < ?1 LIMIT ?2)",
                    params![cutoff, batch as i64],
                )?
            };
            total += deleted as u64;
            if deleted < batch {
                return Ok(total);
            }
        }
    }
}

impl LogStore for SqliteStore {
    fn append(&self, record: &RequestRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO request_logs (ip, timestamp, path, country, city)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.address.to_string(),
                fmt_ts(record.timestamp),
                record.path,
                record.country,
                record.city,
            ],
        )?;
        Ok(())
    }

    fn count_by_address(
        &self,
        since: DateTime<Utc>,
        filter: &PathFilter,
    ) -> StoreResult<HashMap<IpAddr, u64>> {
        let conn = self.conn.lock();
        let since = fmt_ts(since);

        let rows: Vec<(String, i64)> = match filter {
            PathFilter::Any => {
                let mut stmt = conn.prepare(
                    "SELECT ip, COUNT(*) FROM request_logs
                     WHERE timestamp >= ?1 GROUP BY ip",
                )?;
                let rows = stmt.query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            PathFilter::Prefix(prefix) => {
                // substr() avoids LIKE wildcard escaping.
                let mut stmt = conn.prepare(
                    "SELECT ip, COUNT(*) FROM request_logs
                     WHERE timestamp >= ?1 AND substr(path, 1, length(?2)) = ?2
                     GROUP BY ip",
                )?;
                let rows = stmt
                    .query_map(params![since, prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            PathFilter::Exact(path) => {
                let mut stmt = conn.prepare(
                    "SELECT ip, COUNT(*) FROM request_logs
                     WHERE timestamp >= ?1 AND path = ?2
                     GROUP BY ip",
                )?;
                let rows =
                    stmt.query_map(params![since, path], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        let mut counts = HashMap::with_capacity(rows.len());
        for (ip, count) in rows {
            counts.insert(parse_ip(&ip)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.delete_in_batches(cutoff, PURGE_BATCH)
    }

    fn recent(&self, address: Option<IpAddr>, limit: usize) -> StoreResult<Vec<RequestRecord>> {
        let conn = self.conn.lock();
        let raw: Vec<RawRequest> = match address {
            Some(ip) => {
                let mut stmt = conn.prepare(
                    "SELECT ip, timestamp, path, country, city FROM request_logs
                     WHERE ip = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![ip.to_string(), limit as i64], RawRequest::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT ip, timestamp, path, country, city FROM request_logs
                     ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], RawRequest::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };
        raw.into_iter().map(RawRequest::into_record).collect()
    }
}

impl BlockStore for SqliteStore {
    fn upsert_block(
        &self,
        address: IpAddr,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<BlockOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ip = address.to_string();

        let existing: Option<bool> = tx
            .query_row(
                "SELECT is_active FROM blocked_ips WHERE ip = ?1",
                params![ip],
                |row| Ok(row.get::<_, i32>(0)? != 0),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO blocked_ips (ip, reason, created_at, is_active)
                     VALUES (?1, ?2, ?3, 1)",
                    params![ip, reason, fmt_ts(now)],
                )?;
                BlockOutcome::Created
            }
            Some(true) => BlockOutcome::AlreadyBlocked,
            Some(false) => {
                if reason.is_empty() {
                    tx.execute(
                        "UPDATE blocked_ips SET is_active = 1 WHERE ip = ?1",
                        params![ip],
                    )?;
                } else {
                    tx.execute(
                        "UPDATE blocked_ips SET is_active = 1, reason = ?2 WHERE ip = ?1",
                        params![ip, reason],
                    )?;
                }
                BlockOutcome::Reactivated
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn deactivate(&self, address: IpAddr) -> StoreResult<UnblockOutcome> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE blocked_ips SET is_active = 0 WHERE ip = ?1",
            params![address.to_string()],
        )?;
        Ok(if changed > 0 {
            UnblockOutcome::Unblocked
        } else {
            UnblockOutcome::NotFound
        })
    }

    fn is_active(&self, address: IpAddr) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let active: Option<i32> = conn
            .query_row(
                "SELECT is_active FROM blocked_ips WHERE ip = ?1",
                params![address.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(0) != 0)
    }

    fn list_blocks(&self, only_active: bool) -> StoreResult<Vec<BlockEntry>> {
        let conn = self.conn.lock();
        let sql = if only_active {
            "SELECT ip, reason, created_at, is_active FROM blocked_ips
             WHERE is_active = 1 ORDER BY created_at DESC, id DESC"
        } else {
            "SELECT ip, reason, created_at, is_active FROM blocked_ips
             ORDER BY created_at DESC, id DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let raw: Vec<RawBlock> = stmt
            .query_map([], RawBlock::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(RawBlock::into_entry).collect()
    }
}

const FLAG_COLUMNS: &str =
    "id, ip, category, reason, flagged_at, request_count, is_resolved, resolved_at, notes, subject";

fn insert_flag_row(conn: &Connection, flag: &NewFlag) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO suspicious_ips (ip, category, reason, flagged_at, request_count, subject)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            flag.address.to_string(),
            flag.category.as_str(),
            flag.reason,
            fmt_ts(flag.flagged_at),
            flag.request_count as i64,
            flag.subject,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl FlagStore for SqliteStore {
    fn insert_flag_unless_recent(
        &self,
        flag: &NewFlag,
        since: DateTime<Utc>,
        scope: &DedupScope,
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ip = flag.address.to_string();
        let since = fmt_ts(since);

        let existing: i64 = match scope {
            DedupScope::AnyCategory => tx.query_row(
                "SELECT COUNT(*) FROM suspicious_ips
                 WHERE ip = ?1 AND is_resolved = 0 AND flagged_at >= ?2",
                params![ip, since],
                |row| row.get(0),
            )?,
            // A sensitive-path flag counts when its prefix is a prefix of `path`.
            DedupScope::Path { category, path } => tx.query_row(
                "SELECT COUNT(*) FROM suspicious_ips
                 WHERE ip = ?1 AND is_resolved = 0 AND flagged_at >= ?2
                   AND (category = ?3
                        OR (category = ?4 AND subject IS NOT NULL
                            AND substr(?5, 1, length(subject)) = subject))",
                params![
                    ip,
                    since,
                    category.as_str(),
                    RuleCategory::SensitivePath.as_str(),
                    path
                ],
                |row| row.get(0),
            )?,
        };

        if existing > 0 {
            return Ok(None);
        }

        let id = insert_flag_row(&tx, flag)?;
        tx.commit()?;
        Ok(Some(id))
    }

    fn insert_flag(&self, flag: &NewFlag) -> StoreResult<i64> {
        let conn = self.conn.lock();
        Ok(insert_flag_row(&conn, flag)?)
    }

    fn unresolved_counts_since(&self, since: DateTime<Utc>) -> StoreResult<HashMap<IpAddr, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ip, COUNT(*) FROM suspicious_ips
             WHERE is_resolved = 0 AND flagged_at >= ?1
             GROUP BY ip",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map(params![fmt_ts(since)], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut counts = HashMap::with_capacity(rows.len());
        for (ip, count) in rows {
            counts.insert(parse_ip(&ip)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn resolve_all(
        &self,
        address: IpAddr,
        resolved_at: DateTime<Utc>,
        notes: &str,
    ) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE suspicious_ips SET is_resolved = 1, resolved_at = ?2, notes = ?3
             WHERE ip = ?1 AND is_resolved = 0",
            params![address.to_string(), fmt_ts(resolved_at), notes],
        )?;
        Ok(changed as u64)
    }

    fn resolve_flag(
        &self,
        id: i64,
        resolved_at: DateTime<Utc>,
        notes: Option<&str>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE suspicious_ips SET is_resolved = 1, resolved_at = ?2,
                    notes = COALESCE(?3, notes)
             WHERE id = ?1 AND is_resolved = 0",
            params![id, fmt_ts(resolved_at), notes],
        )?;
        Ok(changed > 0)
    }

    fn list_flags(&self, resolved: Option<bool>, limit: usize) -> StoreResult<Vec<SuspicionFlag>> {
        let conn = self.conn.lock();
        let raw: Vec<RawFlag> = match resolved {
            Some(state) => {
                let sql = format!(
                    "SELECT {} FROM suspicious_ips WHERE is_resolved = ?1
                     ORDER BY flagged_at DESC, id DESC LIMIT ?2",
                    FLAG_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![state as i32, limit as i64], RawFlag::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM suspicious_ips ORDER BY flagged_at DESC, id DESC LIMIT ?1",
                    FLAG_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit as i64], RawFlag::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };
        raw.into_iter().map(RawFlag::into_flag).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteStore {
        SqliteStore::new(":memory:").unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn flag(addr: &str, category: RuleCategory, at: DateTime<Utc>) -> NewFlag {
        NewFlag {
            address: ip(addr),
            category,
            reason: format!("{} test", category),
            subject: None,
            request_count: 1,
            flagged_at: at,
        }
    }

    #[test]
    fn test_timestamp_format_round_trips() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_count_by_address_with_filters() {
        let s = store();
        let now = Utc::now();
        for path in ["/admin", "/admin/users", "/login", "/"] {
            s.append(&RequestRecord::at(ip("1.1.1.1"), path, None, now)).unwrap();
        }
        s.append(&RequestRecord::at(ip("2.2.2.2"), "/login", None, now)).unwrap();
        // Outside the window.
        s.append(&RequestRecord::at(ip("2.2.2.2"), "/login", None, now - Duration::hours(2)))
            .unwrap();

        let since = now - Duration::hours(1);
        let all = s.count_by_address(since, &PathFilter::Any).unwrap();
        assert_eq!(all[&ip("1.1.1.1")], 4);
        assert_eq!(all[&ip("2.2.2.2")], 1);

        let admin = s
            .count_by_address(since, &PathFilter::Prefix("/admin".into()))
            .unwrap();
        assert_eq!(admin.get(&ip("1.1.1.1")), Some(&2));
        assert!(!admin.contains_key(&ip("2.2.2.2")));

        let login = s
            .count_by_address(since, &PathFilter::Exact("/login".into()))
            .unwrap();
        assert_eq!(login.len(), 2);
    }

    #[test]
    fn test_prefix_filter_treats_wildcards_literally() {
        let s = store();
        let now = Utc::now();
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/a_b", None, now)).unwrap();
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/axb", None, now)).unwrap();
        let counts = s
            .count_by_address(now - Duration::hours(1), &PathFilter::Prefix("/a_".into()))
            .unwrap();
        assert_eq!(counts[&ip("1.1.1.1")], 1);
    }

    #[test]
    fn test_purge_runs_in_batches() {
        let s = store();
        let now = Utc::now();
        for i in 0..7 {
            s.append(&RequestRecord::at(ip("1.1.1.1"), "/old", None, now - Duration::days(40 + i)))
                .unwrap();
        }
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/new", None, now)).unwrap();

        let deleted = s.delete_in_batches(now - Duration::days(30), 3).unwrap();
        assert_eq!(deleted, 7);
        let left = s.recent(None, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].path, "/new");
    }

    #[test]
    fn test_upsert_block_lifecycle() {
        let s = store();
        let addr = ip("203.0.113.9");
        let now = Utc::now();

        assert_eq!(s.upsert_block(addr, "spam", now).unwrap(), BlockOutcome::Created);
        assert_eq!(
            s.upsert_block(addr, "other", now).unwrap(),
            BlockOutcome::AlreadyBlocked
        );
        assert!(s.is_active(addr).unwrap());

        assert_eq!(s.deactivate(addr).unwrap(), UnblockOutcome::Unblocked);
        assert!(!s.is_active(addr).unwrap());

        // Empty reason keeps the original text.
        assert_eq!(s.upsert_block(addr, "", now).unwrap(), BlockOutcome::Reactivated);
        let entries = s.list_blocks(true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "spam");

        s.deactivate(addr).unwrap();
        s.upsert_block(addr, "abuse", now).unwrap();
        assert_eq!(s.list_blocks(true).unwrap()[0].reason, "abuse");
    }

    #[test]
    fn test_deactivate_unknown_is_not_found() {
        let s = store();
        assert_eq!(s.deactivate(ip("10.0.0.1")).unwrap(), UnblockOutcome::NotFound);
    }

    #[test]
    fn test_list_blocks_newest_first() {
        let s = store();
        let now = Utc::now();
        s.upsert_block(ip("1.1.1.1"), "a", now - Duration::minutes(5)).unwrap();
        s.upsert_block(ip("2.2.2.2"), "b", now).unwrap();
        s.upsert_block(ip("3.3.3.3"), "c", now - Duration::minutes(1)).unwrap();
        s.deactivate(ip("3.3.3.3")).unwrap();

        let active: Vec<_> = s.list_blocks(true).unwrap().into_iter().map(|e| e.address).collect();
        assert_eq!(active, vec![ip("2.2.2.2"), ip("1.1.1.1")]);

        let all: Vec<_> = s.list_blocks(false).unwrap().into_iter().map(|e| e.address).collect();
        assert_eq!(all, vec![ip("2.2.2.2"), ip("3.3.3.3"), ip("1.1.1.1")]);
    }

    #[test]
    fn test_flag_dedup_scopes() {
        let s = store();
        let now = Utc::now();
        let since = now - Duration::hours(24);

        let first = s
            .insert_flag_unless_recent(
                &flag("1.1.1.1", RuleCategory::SensitivePath, now),
                since,
                &DedupScope::AnyCategory,
            )
            .unwrap();
        assert!(first.is_some());

        let volume = s
            .insert_flag_unless_recent(
                &flag("1.1.1.1", RuleCategory::Volume, now),
                since,
                &DedupScope::AnyCategory,
            )
            .unwrap();
        assert!(volume.is_none());

        let login = s
            .insert_flag_unless_recent(
                &flag("1.1.1.1", RuleCategory::LoginAttempts, now),
                since,
                &DedupScope::Path {
                    category: RuleCategory::LoginAttempts,
                    path: "/login".into(),
                },
            )
            .unwrap();
        assert!(login.is_some());

        let again = s
            .insert_flag_unless_recent(
                &flag("1.1.1.1", RuleCategory::LoginAttempts, now),
                since,
                &DedupScope::Path {
                    category: RuleCategory::LoginAttempts,
                    path: "/login".into(),
                },
            )
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_login_scope_honours_enclosing_sensitive_prefix() {
        let s = store();
        let now = Utc::now();
        let since = now - Duration::hours(24);
        let scope = DedupScope::Path {
            category: RuleCategory::LoginAttempts,
            path: "/login".into(),
        };

        let mut admin = flag("1.1.1.1", RuleCategory::SensitivePath, now);
        admin.subject = Some("/admin".into());
        s.insert_flag(&admin).unwrap();
        let login = flag("1.1.1.1", RuleCategory::LoginAttempts, now);
        assert!(s.insert_flag_unless_recent(&login, since, &scope).unwrap().is_some());

        let mut sensitive = flag("2.2.2.2", RuleCategory::SensitivePath, now);
        sensitive.subject = Some("/login".into());
        s.insert_flag(&sensitive).unwrap();
        let login = flag("2.2.2.2", RuleCategory::LoginAttempts, now);
        assert!(s.insert_flag_unless_recent(&login, since, &scope).unwrap().is_none());

        let stored = s.list_flags(None, 10).unwrap();
        assert!(stored
            .iter()
            .any(|f| f.subject.as_deref() == Some("/login") && f.category == RuleCategory::SensitivePath));
    }

    #[test]
    fn test_old_or_resolved_flags_do_not_suppress() {
        let s = store();
        let now = Utc::now();
        let since = now - Duration::hours(24);

        s.insert_flag(&flag("1.1.1.1", RuleCategory::Volume, now - Duration::hours(25)))
            .unwrap();
        let resolved = s.insert_flag(&flag("2.2.2.2", RuleCategory::Volume, now)).unwrap();
        assert!(s.resolve_flag(resolved, now, Some("ok")).unwrap());

        for addr in ["1.1.1.1", "2.2.2.2"] {
            let id = s
                .insert_flag_unless_recent(
                    &flag(addr, RuleCategory::Volume, now),
                    since,
                    &DedupScope::AnyCategory,
                )
                .unwrap();
            assert!(id.is_some(), "{} should be flaggable", addr);
        }
    }

    #[test]
    fn test_resolve_all_and_counts() {
        let s = store();
        let now = Utc::now();
        for _ in 0..3 {
            s.insert_flag(&flag("1.1.1.1", RuleCategory::Volume, now)).unwrap();
        }
        s.insert_flag(&flag("2.2.2.2", RuleCategory::Volume, now)).unwrap();

        let counts = s.unresolved_counts_since(now - Duration::hours(24)).unwrap();
        assert_eq!(counts[&ip("1.1.1.1")], 3);
        assert_eq!(counts[&ip("2.2.2.2")], 1);

        assert_eq!(s.resolve_all(ip("1.1.1.1"), now, "done").unwrap(), 3);
        let open = s.list_flags(Some(false), 100).unwrap();
        assert_eq!(open.len(), 1);
        let closed = s.list_flags(Some(true), 100).unwrap();
        assert_eq!(closed.len(), 3);
        assert!(closed.iter().all(|f| f.notes.as_deref() == Some("done")));
        assert!(closed.iter().all(|f| f.resolved_at.is_some()));
    }

    #[test]
    fn test_resolve_unknown_flag() {
        let s = store();
        assert!(!s.resolve_flag(42, Utc::now(), None).unwrap());
    }

    #[test]
    fn test_delete_older_than() {
        let s = store();
        let now = Utc::now();
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/", None, now - Duration::days(31))).unwrap();
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/", None, now)).unwrap();
        assert_eq!(s.delete_older_than(now - Duration::days(30)).unwrap(), 1);
        assert_eq!(s.recent(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_recent_filters_by_address() {
        let s = store();
        let now = Utc::now();
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/a", None, now - Duration::seconds(2)))
            .unwrap();
        s.append(&RequestRecord::at(ip("1.1.1.1"), "/b", None, now)).unwrap();
        s.append(&RequestRecord::at(ip("2.2.2.2"), "/c", None, now)).unwrap();

        let recent = s.recent(Some(ip("1.1.1.1")), 10).unwrap();
        let paths: Vec<_> = recent.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/b", "/a"]);
    }
}
