use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::config::settings::GateConfig;
use crate::models::request::{Location, RequestRecord};
use crate::protection::blocklist::BlockRegistry;
use crate::protection::geoip::GeoResolver;
use crate::storage::cache::{DecisionCache, Lookup};
use crate::storage::LogStore;

/// Result of gating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Actively blocked; answer 403 and write nothing.
    Forbidden,
    /// Allowed and logged.
    Admitted(Option<Location>),
    /// Path is exempt; neither gated nor logged.
    Exempt,
}

impl GateDecision {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, GateDecision::Forbidden)
    }
}

// ---------------------------------------------------------------------------
// Client address extraction
// ---------------------------------------------------------------------------

/// When `X-Forwarded-For` may be believed.
#[derive(Debug, Clone, Default)]
pub struct ForwardedTrust {
    enabled: bool,
    proxies: Vec<IpNet>,
}

impl ForwardedTrust {
    pub fn new(enabled: bool, proxies: Vec<IpNet>) -> Self {
        Self { enabled, proxies }
    }

    /// Build from configuration. Unparseable CIDRs are skipped with a warning.
    pub fn from_config(config: &GateConfig) -> Self {
        let proxies = config
            .trusted_proxies
            .iter()
            .filter_map(|cidr| match cidr.trim().parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(cidr = %cidr, error = %e, "Ignoring invalid trusted proxy range");
                    None
                }
            })
            .collect();
        Self::new(config.trust_forwarded_for, proxies)
    }

    pub fn trusts(&self, peer: IpAddr) -> bool {
        self.enabled && (self.proxies.is_empty() || self.proxies.iter().any(|n| n.contains(&peer)))
    }
}

/// Determine the client address: the left-most `X-Forwarded-For` entry when
/// the peer is trusted and the entry parses, else the peer itself. The
/// result is canonical, so IPv4-mapped IPv6 comes back as plain IPv4.
pub fn client_address(headers: &HeaderMap, peer: IpAddr, trust: &ForwardedTrust) -> IpAddr {
    let peer = peer.to_canonical();
    if !trust.trusts(peer) {
        return peer;
    }

    if let Some(xff) = headers.get("x-forwarded-for") {
        if let Ok(val) = xff.to_str() {
            if let Some(first) = val.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip.to_canonical();
                }
            }
        }
    }

    peer
}

// ---------------------------------------------------------------------------
// RequestGate
// ---------------------------------------------------------------------------

/// Per-request decision path: blocked check, geolocation, logging.
///
/// Store calls run on the blocking pool; a long job holding the store
/// must not park runtime workers.
pub struct RequestGate {
    registry: Arc<BlockRegistry>,
    cache: Arc<DecisionCache>,
    resolver: Arc<GeoResolver>,
    log: Arc<dyn LogStore>,
    trust: ForwardedTrust,
    exempt_paths: Vec<String>,
}

impl RequestGate {
    pub fn new(
        registry: Arc<BlockRegistry>,
        cache: Arc<DecisionCache>,
        resolver: Arc<GeoResolver>,
        log: Arc<dyn LogStore>,
        config: &GateConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            resolver,
            log,
            trust: ForwardedTrust::from_config(config),
            exempt_paths: config.exempt_paths.clone(),
        }
    }

    pub fn client_address(&self, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
        client_address(headers, peer, &self.trust)
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Blocked status through the cache. Registry errors admit and are
    /// not cached.
    pub async fn is_blocked(&self, address: IpAddr) -> bool {
        if let Lookup::Hit(blocked) = self.cache.get_blocked(&address) {
            return blocked;
        }

        let registry = self.registry.clone();
        match tokio::task::spawn_blocking(move || registry.is_active(address)).await {
            Ok(Ok(blocked)) => {
                self.cache.set_blocked(&address, blocked);
                blocked
            }
            Ok(Err(e)) => {
                warn!(ip = %address, error = %e, "Blocklist lookup failed, admitting request");
                false
            }
            Err(e) => {
                warn!(ip = %address, error = %e, "Blocklist lookup task failed, admitting request");
                false
            }
        }
    }

    pub async fn admit(&self, address: IpAddr, path: &str) -> GateDecision {
        if self.is_exempt(path) {
            return GateDecision::Exempt;
        }

        let address = address.to_canonical();
        if self.is_blocked(address).await {
            info!(ip = %address, path = %path, "Blocked request from denylisted IP");
            return GateDecision::Forbidden;
        }

        let location = self.resolver.resolve(address).await;
        let record = RequestRecord::new(address, path, location.clone());
        let log = self.log.clone();
        match tokio::task::spawn_blocking(move || log.append(&record)).await {
            Ok(Ok(())) => debug!(ip = %address, path = %path, "Request logged"),
            Ok(Err(e)) => warn!(ip = %address, path = %path, error = %e, "Failed to log request"),
            Err(e) => warn!(ip = %address, path = %path, error = %e, "Request log task failed"),
        }

        GateDecision::Admitted(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::{DateTime, Utc};

    use crate::config::defaults::default_gate_config;
    use crate::protection::geoip::tests::{berlin, CountingProvider};
    use crate::storage::memory::MemoryStore;
    use crate::storage::{PathFilter, StoreError, StoreResult};

    struct FailingLog;

    impl LogStore for FailingLog {
        fn append(&self, _record: &RequestRecord) -> StoreResult<()> {
            Err(StoreError::Corrupt("disk full".into()))
        }

        fn count_by_address(
            &self,
            _since: DateTime<Utc>,
            _filter: &PathFilter,
        ) -> StoreResult<HashMap<IpAddr, u64>> {
            Ok(HashMap::new())
        }

        fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> StoreResult<u64> {
            Ok(0)
        }

        fn recent(&self, _address: Option<IpAddr>, _limit: usize) -> StoreResult<Vec<RequestRecord>> {
            Ok(Vec::new())
        }
    }

    /// Log store whose appends hold the calling thread.
    struct SlowLog(std::time::Duration);

    impl LogStore for SlowLog {
        fn append(&self, _record: &RequestRecord) -> StoreResult<()> {
            std::thread::sleep(self.0);
            Ok(())
        }

        fn count_by_address(
            &self,
            _since: DateTime<Utc>,
            _filter: &PathFilter,
        ) -> StoreResult<HashMap<IpAddr, u64>> {
            Ok(HashMap::new())
        }

        fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> StoreResult<u64> {
            Ok(0)
        }

        fn recent(&self, _address: Option<IpAddr>, _limit: usize) -> StoreResult<Vec<RequestRecord>> {
            Ok(Vec::new())
        }
    }

    fn gate_with_log(log: Arc<dyn LogStore>) -> RequestGate {
        let cache = Arc::new(DecisionCache::default());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(BlockRegistry::new(store, cache.clone()));
        let resolver = Arc::new(GeoResolver::new(
            Arc::new(CountingProvider::new(berlin)),
            cache.clone(),
            std::time::Duration::from_secs(2),
        ));
        RequestGate::new(registry, cache, resolver, log, &default_gate_config())
    }

    struct Fixture {
        gate: RequestGate,
        registry: Arc<BlockRegistry>,
        store: Arc<MemoryStore>,
        provider: Arc<CountingProvider>,
    }

    fn fixture(config: GateConfig) -> Fixture {
        let cache = Arc::new(DecisionCache::default());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(BlockRegistry::new(store.clone(), cache.clone()));
        let provider = Arc::new(CountingProvider::new(berlin));
        let resolver = Arc::new(GeoResolver::new(
            provider.clone(),
            cache.clone(),
            std::time::Duration::from_secs(2),
        ));
        let gate = RequestGate::new(registry.clone(), cache, resolver, store.clone(), &config);
        Fixture {
            gate,
            registry,
            store,
            provider,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_blocked_address_is_forbidden_and_not_logged() {
        let f = fixture(default_gate_config());
        let addr = ip("203.0.113.9");
        f.registry.block(addr, "abuse").unwrap();

        assert_eq!(f.gate.admit(addr, "/").await, GateDecision::Forbidden);
        assert!(f.store.recent(Some(addr), 10).unwrap().is_empty());
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_block_then_unblock_admits() {
        let f = fixture(default_gate_config());
        let addr = ip("203.0.113.9");
        f.registry.block(addr, "abuse").unwrap();
        assert!(f.gate.admit(addr, "/").await.is_forbidden());

        f.registry.unblock(addr).unwrap();
        let decision = f.gate.admit(addr, "/home").await;
        assert!(matches!(decision, GateDecision::Admitted(Some(_))));

        let logged = f.store.recent(Some(addr), 10).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].path, "/home");
        assert_eq!(logged[0].country.as_deref(), Some("Germany"));
    }

    #[tokio::test]
    async fn test_private_address_logged_without_location() {
        let f = fixture(default_gate_config());
        let addr = ip("192.168.1.20");
        assert_eq!(f.gate.admit(addr, "/").await, GateDecision::Admitted(None));
        let logged = f.store.recent(Some(addr), 10).unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].country.is_none());
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_log_failure_is_swallowed() {
        let gate = gate_with_log(Arc::new(FailingLog));
        let decision = gate.admit(ip("8.8.8.8"), "/").await;
        assert!(matches!(decision, GateDecision::Admitted(_)));
    }

    #[tokio::test]
    async fn test_slow_store_does_not_stall_runtime() {
        let gate = Arc::new(gate_with_log(Arc::new(SlowLog(
            std::time::Duration::from_millis(400),
        ))));
        let pending = tokio::spawn({
            let gate = gate.clone();
            async move { gate.admit(ip("192.168.1.1"), "/").await }
        });

        // Single-threaded runtime: this timer only fires on time if the
        // append is off the runtime thread.
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(300));

        assert_eq!(pending.await.unwrap(), GateDecision::Admitted(None));
    }

    #[tokio::test]
    async fn test_mapped_address_hits_plain_block() {
        let f = fixture(default_gate_config());
        f.registry.block(ip("203.0.113.9"), "abuse").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "::ffff:203.0.113.9".parse().unwrap());
        let client = f.gate.client_address(&headers, ip("10.0.0.2"));
        assert_eq!(client, ip("203.0.113.9"));
        assert!(f.gate.admit(client, "/").await.is_forbidden());

        // A mapped address reaching admit directly is folded the same way.
        assert!(f.gate.admit(ip("::ffff:203.0.113.9"), "/").await.is_forbidden());
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_exempt_paths_skip_logging() {
        let mut config = default_gate_config();
        config.exempt_paths = vec!["/healthz".into()];
        let f = fixture(config);
        let addr = ip("203.0.113.9");
        f.registry.block(addr, "").unwrap();

        assert_eq!(f.gate.admit(addr, "/healthz").await, GateDecision::Exempt);
        assert!(f.store.recent(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_status_is_cached() {
        let f = fixture(default_gate_config());
        let addr = ip("198.51.100.1");
        assert!(!f.gate.is_blocked(addr).await);
        assert_eq!(f.gate.cache.get_blocked(&addr), Lookup::Hit(false));
    }

    #[test]
    fn test_client_address_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " 203.0.113.7 , 10.0.0.1".parse().unwrap());
        let peer = ip("10.0.0.2");
        let trust = ForwardedTrust::new(true, Vec::new());
        assert_eq!(client_address(&headers, peer, &trust), ip("203.0.113.7"));
    }

    #[test]
    fn test_client_address_falls_back_to_peer() {
        let peer = ip("10.0.0.2");
        let trust = ForwardedTrust::new(true, Vec::new());
        assert_eq!(client_address(&HeaderMap::new(), peer, &trust), peer);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip, 1.2.3.4".parse().unwrap());
        assert_eq!(client_address(&headers, peer, &trust), peer);
    }

    #[test]
    fn test_untrusted_peer_ignores_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7".parse().unwrap());

        let disabled = ForwardedTrust::new(false, Vec::new());
        assert_eq!(client_address(&headers, ip("10.0.0.2"), &disabled), ip("10.0.0.2"));

        let scoped = ForwardedTrust::new(true, vec!["10.0.0.0/8".parse().unwrap()]);
        assert_eq!(client_address(&headers, ip("10.0.0.2"), &scoped), ip("203.0.113.7"));
        assert_eq!(client_address(&headers, ip("192.0.2.1"), &scoped), ip("192.0.2.1"));
    }
}
