use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::settings::{GeoProviderKind, GeolocationConfig};
use crate::models::request::Location;
use crate::storage::cache::{DecisionCache, Lookup};

// ---------------------------------------------------------------------------
// Provider seam
// ---------------------------------------------------------------------------

/// What a provider knows about an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoLookup {
    Found(Location),
    /// The provider answered and has no location for the address.
    NotFound,
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Database(String),
}

/// An external (untrusted, possibly slow) source of locations.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, address: IpAddr) -> Result<GeoLookup, GeoError>;

    fn name(&self) -> &'static str;
}

/// Build the provider selected in the configuration. An mmdb provider whose
/// database cannot be opened degrades to [`DisabledProvider`].
pub fn build_provider(config: &GeolocationConfig) -> Arc<dyn GeoProvider> {
    match config.provider {
        GeoProviderKind::Http => Arc::new(HttpGeoProvider::new(&config.url_template)),
        GeoProviderKind::Mmdb => match MmdbGeoProvider::open(&config.city_db) {
            Some(p) => Arc::new(p),
            None => Arc::new(DisabledProvider),
        },
        GeoProviderKind::Disabled => Arc::new(DisabledProvider),
    }
}

// ---------------------------------------------------------------------------
// HTTP JSON provider
// ---------------------------------------------------------------------------

/// Queries a JSON geolocation API such as ip-api.com.
///
/// The body must carry `status`; `"success"` means `country` / `city` are
/// populated, any other status is an explicit miss.
pub struct HttpGeoProvider {
    url_template: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    country: Option<String>,
    city: Option<String>,
    message: Option<String>,
}

impl HttpGeoProvider {
    pub fn new(url_template: &str) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();
        Self {
            url_template: url_template.to_string(),
            client,
        }
    }

    fn url_for(&self, address: IpAddr) -> String {
        self.url_template.replace("{ip}", &address.to_string())
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Interpret a provider response body.
fn parse_response(body: &[u8]) -> Result<GeoLookup, GeoError> {
    let parsed: ApiResponse =
        serde_json::from_slice(body).map_err(|e| GeoError::Malformed(e.to_string()))?;

    if parsed.status != "success" {
        debug!(
            status = %parsed.status,
            message = parsed.message.as_deref().unwrap_or("-"),
            "Geolocation provider reported no result"
        );
        return Ok(GeoLookup::NotFound);
    }

    let location = Location {
        country: non_empty(parsed.country),
        city: non_empty(parsed.city),
    };
    if location.country.is_none() && location.city.is_none() {
        return Ok(GeoLookup::NotFound);
    }
    Ok(GeoLookup::Found(location))
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn lookup(&self, address: IpAddr) -> Result<GeoLookup, GeoError> {
        let req = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(self.url_for(address))
            .header("Accept", "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| GeoError::Transport(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| GeoError::Transport(e.to_string()))?;

        let status = resp.status();
        if status != hyper::StatusCode::OK {
            return Err(GeoError::Status(status.as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| GeoError::Transport(e.to_string()))?
            .to_bytes();

        parse_response(&body)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// Local MaxMind database provider
// ---------------------------------------------------------------------------

/// Reads a GeoLite2-City database from disk.
pub struct MmdbGeoProvider {
    reader: maxminddb::Reader<Vec<u8>>,
}

#[derive(Deserialize, Debug)]
struct GeoIpCity {
    city: Option<NamedRecord>,
    country: Option<NamedRecord>,
}

#[derive(Deserialize, Debug)]
struct NamedRecord {
    names: Option<HashMap<String, String>>,
}

impl NamedRecord {
    fn english(self) -> Option<String> {
        self.names.and_then(|mut names| names.remove("en"))
    }
}

impl MmdbGeoProvider {
    pub fn open(city_db: &str) -> Option<Self> {
        if !Path::new(city_db).exists() {
            warn!(path = city_db, "GeoIP city database file not found");
            return None;
        }
        match maxminddb::Reader::open_readfile(city_db) {
            Ok(reader) => {
                info!(path = city_db, "GeoIP city database loaded successfully");
                Some(Self { reader })
            }
            Err(e) => {
                warn!(path = city_db, error = %e, "Failed to load GeoIP city database");
                None
            }
        }
    }
}

#[async_trait]
impl GeoProvider for MmdbGeoProvider {
    async fn lookup(&self, address: IpAddr) -> Result<GeoLookup, GeoError> {
        match self.reader.lookup::<GeoIpCity>(address) {
            Ok(result) => {
                let location = Location {
                    country: result.country.and_then(NamedRecord::english),
                    city: result.city.and_then(NamedRecord::english),
                };
                if location.country.is_none() && location.city.is_none() {
                    Ok(GeoLookup::NotFound)
                } else {
                    Ok(GeoLookup::Found(location))
                }
            }
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => Ok(GeoLookup::NotFound),
            Err(e) => Err(GeoError::Database(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "mmdb"
    }
}

// ---------------------------------------------------------------------------
// Disabled provider
// ---------------------------------------------------------------------------

pub struct DisabledProvider;

#[async_trait]
impl GeoProvider for DisabledProvider {
    async fn lookup(&self, _address: IpAddr) -> Result<GeoLookup, GeoError> {
        Ok(GeoLookup::NotFound)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Private, loopback, link-local and unspecified addresses have no useful
/// location and are never sent to the provider.
pub fn is_non_routable(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_non_routable(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (first & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

/// Best-effort geolocation with caching. Never fails: every problem ends
/// as "unresolved".
pub struct GeoResolver {
    provider: Arc<dyn GeoProvider>,
    cache: Arc<DecisionCache>,
    timeout: Duration,
}

impl GeoResolver {
    pub fn new(provider: Arc<dyn GeoProvider>, cache: Arc<DecisionCache>, timeout: Duration) -> Self {
        info!(provider = provider.name(), timeout_ms = timeout.as_millis() as u64, "Geolocation resolver ready");
        Self {
            provider,
            cache,
            timeout,
        }
    }

    pub async fn resolve(&self, address: IpAddr) -> Option<Location> {
        if is_non_routable(&address) {
            return None;
        }

        if let Lookup::Hit(cached) = self.cache.get_geo(&address) {
            return cached;
        }

        let ttls = *self.cache.ttls();
        let outcome = match tokio::time::timeout(self.timeout, self.provider.lookup(address)).await {
            Ok(result) => result,
            Err(_) => Err(GeoError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(GeoLookup::Found(location)) => {
                debug!(
                    ip = %address,
                    country = location.country.as_deref().unwrap_or("-"),
                    city = location.city.as_deref().unwrap_or("-"),
                    "Geolocation resolved"
                );
                self.cache.set_geo(&address, Some(location.clone()), ttls.geo);
                Some(location)
            }
            Ok(GeoLookup::NotFound) => {
                self.cache.set_geo(&address, None, ttls.geo);
                None
            }
            Err(e) => {
                warn!(ip = %address, provider = self.provider.name(), error = %e, "Geolocation lookup failed");
                self.cache.set_geo(&address, None, ttls.geo_error);
                None
            }
        }
    }
}
