use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::defaults;

/// Top-level configuration for ipwarden.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_admin_api_config")]
    pub admin_api: AdminApiConfig,

    #[serde(default = "defaults::default_storage_config")]
    pub storage: StorageConfig,

    #[serde(default = "defaults::default_cache_config")]
    pub cache: CacheConfig,

    #[serde(default = "defaults::default_geolocation_config")]
    pub geolocation: GeolocationConfig,

    #[serde(default = "defaults::default_gate_config")]
    pub gate: GateConfig,

    #[serde(default = "defaults::default_detection_config")]
    pub detection: DetectionConfig,

    #[serde(default = "defaults::default_escalation_config")]
    pub escalation: EscalationConfig,

    #[serde(default = "defaults::default_retention_config")]
    pub retention: RetentionConfig,

    #[serde(default = "defaults::default_schedule_config")]
    pub schedule: ScheduleConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,

    #[serde(default = "defaults::default_alerting_config")]
    pub alerting: AlertingConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    /// Like [`Settings::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the jobs cannot turn into a time window.
    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("detection.window_secs", self.detection.window_secs),
            ("detection.dedup_window_secs", self.detection.dedup_window_secs),
            ("escalation.window_secs", self.escalation.window_secs),
            ("retention.days", u64::from(self.retention.days).saturating_mul(86_400)),
        ];
        for (name, secs) in windows {
            if secs == 0 || secs > MAX_WINDOW_SECS {
                bail!("{} must be between 1 second and {} days", name, MAX_WINDOW_SECS / 86_400);
            }
        }
        if self.escalation.flag_threshold == 0 {
            bail!("escalation.flag_threshold must be at least 1");
        }
        Ok(())
    }
}

/// Longest accepted look-back for any job window (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 86_400;

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: defaults::default_server_config(),
            admin_api: defaults::default_admin_api_config(),
            storage: defaults::default_storage_config(),
            cache: defaults::default_cache_config(),
            geolocation: defaults::default_geolocation_config(),
            gate: defaults::default_gate_config(),
            detection: defaults::default_detection_config(),
            escalation: defaults::default_escalation_config(),
            retention: defaults::default_retention_config(),
            schedule: defaults::default_schedule_config(),
            logging: defaults::default_logging_config(),
            alerting: defaults::default_alerting_config(),
        }
    }
}

/// Public listener and upstream application.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_upstream_address")]
    pub upstream: String,

    #[serde(default = "defaults::default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "defaults::default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminApiConfig {
    #[serde(default = "defaults::default_admin_enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::default_admin_bind")]
    pub bind: String,

    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::default_storage_backend")]
    pub backend: StorageBackend,

    #[serde(default = "defaults::default_sqlite_path")]
    pub sqlite_path: String,
}

/// Decision cache TTLs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "defaults::default_blocked_ttl_secs")]
    pub blocked_ttl_secs: u64,

    #[serde(default = "defaults::default_geo_ttl_secs")]
    pub geo_ttl_secs: u64,

    #[serde(default = "defaults::default_geo_error_ttl_secs")]
    pub geo_error_ttl_secs: u64,

    #[serde(default = "defaults::default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttls(&self) -> crate::storage::cache::CacheTtls {
        crate::storage::cache::CacheTtls {
            blocked: Duration::from_secs(self.blocked_ttl_secs),
            geo: Duration::from_secs(self.geo_ttl_secs),
            geo_error: Duration::from_secs(self.geo_error_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoProviderKind {
    Http,
    Mmdb,
    Disabled,
}

/// Geolocation provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeolocationConfig {
    #[serde(default = "defaults::default_geo_provider")]
    pub provider: GeoProviderKind,

    /// `{ip}` is replaced by the address.
    #[serde(default = "defaults::default_geo_url_template")]
    pub url_template: String,

    #[serde(default = "defaults::default_city_db")]
    pub city_db: String,

    #[serde(default = "defaults::default_geo_timeout_ms")]
    pub timeout_ms: u64,
}

/// Request gate behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "defaults::default_trust_forwarded_for")]
    pub trust_forwarded_for: bool,

    /// CIDRs allowed to set X-Forwarded-For. Empty means any peer.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Path prefixes that bypass gating and logging.
    #[serde(default)]
    pub exempt_paths: Vec<String>,
}

/// Anomaly detection thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "defaults::default_detection_window_secs")]
    pub window_secs: u64,

    #[serde(default = "defaults::default_volume_threshold")]
    pub volume_threshold: u64,

    #[serde(default = "defaults::default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,

    #[serde(default = "defaults::default_sensitive_path_threshold")]
    pub sensitive_path_threshold: u64,

    #[serde(default = "defaults::default_login_path")]
    pub login_path: String,

    #[serde(default = "defaults::default_login_threshold")]
    pub login_threshold: u64,

    #[serde(default = "defaults::default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

/// Flag-to-block escalation.
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "defaults::default_escalation_window_secs")]
    pub window_secs: u64,

    #[serde(default = "defaults::default_flag_threshold")]
    pub flag_threshold: u64,
}

/// Request log retention.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "defaults::default_retention_days")]
    pub days: u32,
}

/// Periodic job intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "defaults::default_schedule_enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::default_detect_interval_secs")]
    pub detect_interval_secs: u64,

    #[serde(default = "defaults::default_escalate_interval_secs")]
    pub escalate_interval_secs: u64,

    #[serde(default = "defaults::default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,
}

/// Alerting configuration (webhook notifications).
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.cache.blocked_ttl_secs, 300);
        assert_eq!(s.cache.geo_ttl_secs, 86_400);
        assert_eq!(s.cache.geo_error_ttl_secs, 3_600);
        assert_eq!(s.detection.volume_threshold, 100);
        assert_eq!(s.detection.sensitive_path_threshold, 20);
        assert_eq!(s.detection.login_threshold, 10);
        assert_eq!(s.detection.login_path, "/login");
        assert_eq!(
            s.detection.sensitive_paths,
            vec!["/admin", "/login", "/register", "/api"]
        );
        assert_eq!(s.escalation.flag_threshold, 3);
        assert_eq!(s.retention.days, 30);
        assert_eq!(s.geolocation.provider, GeoProviderKind::Http);
        assert_eq!(s.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_partial_sections_override() {
        let s = Settings::from_toml(
            r#"
            [storage]
            backend = "memory"

            [detection]
            volume_threshold = 250
            sensitive_paths = ["/wp-admin"]

            [gate]
            trusted_proxies = ["10.0.0.0/8"]
            "#,
        )
        .unwrap();
        assert_eq!(s.storage.backend, StorageBackend::Memory);
        assert_eq!(s.detection.volume_threshold, 250);
        assert_eq!(s.detection.login_threshold, 10);
        assert_eq!(s.detection.sensitive_paths, vec!["/wp-admin"]);
        assert_eq!(s.gate.trusted_proxies, vec!["10.0.0.0/8"]);
        assert!(s.gate.trust_forwarded_for);
    }

    #[test]
    fn test_out_of_range_windows_are_rejected() {
        assert!(Settings::from_toml("[detection]\nwindow_secs = 999999999999999").is_err());
        assert!(Settings::from_toml("[escalation]\nwindow_secs = 0").is_err());
        assert!(Settings::from_toml("[retention]\ndays = 4000000000").is_err());
        assert!(Settings::from_toml("[escalation]\nflag_threshold = 0").is_err());
        assert!(Settings::from_toml("[retention]\ndays = 365").is_ok());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        assert!(Settings::from_toml("[geolocation]\nprovider = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let s = Settings::load_or_default("/nonexistent/ipwarden.toml").unwrap();
        assert_eq!(s.server.bind, "0.0.0.0:8000");
    }
}
