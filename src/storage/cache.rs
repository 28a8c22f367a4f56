use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::models::request::Location;

/// Values the cache can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    /// Shadow of `BlockEntry.active`.
    Blocked(bool),
    /// Geolocation result; `None` is a cached negative.
    Geo(Option<Location>),
}

/// Outcome of a cache read. `Miss` means "not known", which is different
/// from a cached negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub blocked: Duration,
    pub geo: Duration,
    pub geo_error: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            blocked: Duration::from_secs(300),
            geo: Duration::from_secs(86_400),
            geo_error: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

/// Short-lived per-address decisions shared by every in-flight request.
///
/// Keys live in two namespaces, `blocked:<addr>` and `geo:<addr>`, each
/// entry carrying its own expiry. Entries are projections of the block
/// registry and of the geolocation provider, never the source of truth.
pub struct DecisionCache {
    entries: DashMap<String, CacheEntry>,
    ttls: CacheTtls,
}

impl DecisionCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            entries: DashMap::new(),
            ttls,
        }
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub fn blocked_key(address: &IpAddr) -> String {
        format!("blocked:{}", address)
    }

    pub fn geo_key(address: &IpAddr) -> String {
        format!("geo:{}", address)
    }

    // -----------------------------------------------------------------------
    // Raw key access
    // -----------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Lookup<CachedValue> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if now < entry.expires_at {
                return Lookup::Hit(entry.value.clone());
            }
        } else {
            return Lookup::Miss;
        }

        // Only evict if still expired; a concurrent set may have refreshed it.
        self.entries.remove_if(key, |_, e| now >= e.expires_at);
        Lookup::Miss
    }

    pub fn set(&self, key: String, value: CachedValue, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Returns whether a (possibly expired) entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    // -----------------------------------------------------------------------
    // blocked: namespace
    // -----------------------------------------------------------------------

    pub fn get_blocked(&self, address: &IpAddr) -> Lookup<bool> {
        match self.get(&Self::blocked_key(address)) {
            Lookup::Hit(CachedValue::Blocked(b)) => Lookup::Hit(b),
            _ => Lookup::Miss,
        }
    }

    pub fn set_blocked(&self, address: &IpAddr, blocked: bool) {
        self.set(
            Self::blocked_key(address),
            CachedValue::Blocked(blocked),
            self.ttls.blocked,
        );
    }

    pub fn invalidate_blocked(&self, address: &IpAddr) {
        if self.delete(&Self::blocked_key(address)) {
            debug!(ip = %address, "Invalidated cached block decision");
        }
    }

    // -----------------------------------------------------------------------
    // geo: namespace
    // -----------------------------------------------------------------------

    pub fn get_geo(&self, address: &IpAddr) -> Lookup<Option<Location>> {
        match self.get(&Self::geo_key(address)) {
            Lookup::Hit(CachedValue::Geo(loc)) => Lookup::Hit(loc),
            _ => Lookup::Miss,
        }
    }

    pub fn set_geo(&self, address: &IpAddr, location: Option<Location>, ttl: Duration) {
        self.set(Self::geo_key(address), CachedValue::Geo(location), ttl);
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Drop expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before.saturating_sub(self.entries.len())
    }

    /// Time left on an entry, expired or not.
    #[cfg(test)]
    pub(crate) fn expires_in(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(CacheTtls::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_absent_key_is_miss() {
        let cache = DecisionCache::default();
        assert_eq!(cache.get_blocked(&ip("1.2.3.4")), Lookup::Miss);
        assert_eq!(cache.get_geo(&ip("1.2.3.4")), Lookup::Miss);
    }

    #[test]
    fn test_cached_negative_is_a_hit() {
        let cache = DecisionCache::default();
        let addr = ip("1.2.3.4");
        cache.set_blocked(&addr, false);
        cache.set_geo(&addr, None, Duration::from_secs(60));
        assert_eq!(cache.get_blocked(&addr), Lookup::Hit(false));
        assert_eq!(cache.get_geo(&addr), Lookup::Hit(None));
    }

    #[test]
    fn test_expired_entry_is_miss_and_evicted() {
        let cache = DecisionCache::default();
        let addr = ip("1.2.3.4");
        cache.set_geo(&addr, None, Duration::ZERO);
        assert_eq!(cache.get_geo(&addr), Lookup::Miss);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_namespaces_are_independent() {
        let cache = DecisionCache::default();
        let addr = ip("1.2.3.4");
        cache.set_blocked(&addr, true);
        assert_eq!(cache.get_geo(&addr), Lookup::Miss);
        cache.invalidate_blocked(&addr);
        assert_eq!(cache.get_blocked(&addr), Lookup::Miss);
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let cache = DecisionCache::default();
        cache.set_blocked(&ip("1.1.1.1"), true);
        cache.set_geo(&ip("2.2.2.2"), None, Duration::ZERO);
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;

        let cache = Arc::new(DecisionCache::default());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let addr = IpAddr::from([10, 0, 0, i]);
                    for _ in 0..1000 {
                        cache.set_blocked(&addr, i % 2 == 0);
                        let _ = cache.get_blocked(&addr);
                        cache.invalidate_blocked(&addr);
                    }
                    cache.set_blocked(&addr, i % 2 == 0);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.get_blocked(&IpAddr::from([10, 0, 0, 2])), Lookup::Hit(true));
        assert_eq!(cache.get_blocked(&IpAddr::from([10, 0, 0, 3])), Lookup::Hit(false));
    }
}
