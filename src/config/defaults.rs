use super::settings::{
    AdminApiConfig, AlertingConfig, CacheConfig, DetectionConfig, EscalationConfig,
    GateConfig, GeoProviderKind, GeolocationConfig, LoggingConfig, RetentionConfig,
    ScheduleConfig, ServerConfig, StorageBackend, StorageConfig,
};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
        upstream: default_upstream_address(),
        max_connections: default_max_connections(),
        upstream_timeout_ms: default_upstream_timeout_ms(),
    }
}

pub fn default_admin_api_config() -> AdminApiConfig {
    AdminApiConfig {
        enabled: default_admin_enabled(),
        bind: default_admin_bind(),
        api_key: String::new(),
    }
}

pub fn default_storage_config() -> StorageConfig {
    StorageConfig {
        backend: default_storage_backend(),
        sqlite_path: default_sqlite_path(),
    }
}

pub fn default_cache_config() -> CacheConfig {
    CacheConfig {
        blocked_ttl_secs: default_blocked_ttl_secs(),
        geo_ttl_secs: default_geo_ttl_secs(),
        geo_error_ttl_secs: default_geo_error_ttl_secs(),
        cleanup_interval_secs: default_cleanup_interval_secs(),
    }
}

pub fn default_geolocation_config() -> GeolocationConfig {
    GeolocationConfig {
        provider: default_geo_provider(),
        url_template: default_geo_url_template(),
        city_db: default_city_db(),
        timeout_ms: default_geo_timeout_ms(),
    }
}

pub fn default_gate_config() -> GateConfig {
    GateConfig {
        trust_forwarded_for: default_trust_forwarded_for(),
        trusted_proxies: Vec::new(),
        exempt_paths: Vec::new(),
    }
}

pub fn default_detection_config() -> DetectionConfig {
    DetectionConfig {
        window_secs: default_detection_window_secs(),
        volume_threshold: default_volume_threshold(),
        sensitive_paths: default_sensitive_paths(),
        sensitive_path_threshold: default_sensitive_path_threshold(),
        login_path: default_login_path(),
        login_threshold: default_login_threshold(),
        dedup_window_secs: default_dedup_window_secs(),
    }
}

pub fn default_escalation_config() -> EscalationConfig {
    EscalationConfig {
        window_secs: default_escalation_window_secs(),
        flag_threshold: default_flag_threshold(),
    }
}

pub fn default_retention_config() -> RetentionConfig {
    RetentionConfig {
        days: default_retention_days(),
    }
}

pub fn default_schedule_config() -> ScheduleConfig {
    ScheduleConfig {
        enabled: default_schedule_enabled(),
        detect_interval_secs: default_detect_interval_secs(),
        escalate_interval_secs: default_escalate_interval_secs(),
        purge_interval_secs: default_purge_interval_secs(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file: default_log_file(),
    }
}

pub fn default_alerting_config() -> AlertingConfig {
    AlertingConfig {
        enabled: false,
        webhook_url: None,
    }
}

// ---------------------------------------------------------------------------
// ServerConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

pub fn default_upstream_address() -> String {
    "127.0.0.1:8080".to_string()
}

pub fn default_max_connections() -> usize {
    10_000
}

pub fn default_upstream_timeout_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// AdminApiConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_admin_enabled() -> bool {
    true
}

pub fn default_admin_bind() -> String {
    "127.0.0.1:9090".to_string()
}

// ---------------------------------------------------------------------------
// StorageConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_storage_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

pub fn default_sqlite_path() -> String {
    "/var/lib/ipwarden/ipwarden.db".to_string()
}

// ---------------------------------------------------------------------------
// CacheConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_blocked_ttl_secs() -> u64 {
    300
}

pub fn default_geo_ttl_secs() -> u64 {
    86_400
}

pub fn default_geo_error_ttl_secs() -> u64 {
    3_600
}

pub fn default_cleanup_interval_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// GeolocationConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_geo_provider() -> GeoProviderKind {
    GeoProviderKind::Http
}

pub fn default_geo_url_template() -> String {
    "http://ip-api.com/json/{ip}".to_string()
}

pub fn default_city_db() -> String {
    "/var/lib/ipwarden/GeoLite2-City.mmdb".to_string()
}

pub fn default_geo_timeout_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// GateConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_trust_forwarded_for() -> bool {
    true
}

// ---------------------------------------------------------------------------
// DetectionConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_detection_window_secs() -> u64 {
    3_600
}

pub fn default_volume_threshold() -> u64 {
    100
}

pub fn default_sensitive_paths() -> Vec<String> {
    ["/admin", "/login", "/register", "/api"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_sensitive_path_threshold() -> u64 {
    20
}

pub fn default_login_path() -> String {
    "/login".to_string()
}

pub fn default_login_threshold() -> u64 {
    10
}

pub fn default_dedup_window_secs() -> u64 {
    86_400
}

// ---------------------------------------------------------------------------
// EscalationConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_escalation_window_secs() -> u64 {
    86_400
}

pub fn default_flag_threshold() -> u64 {
    3
}

// ---------------------------------------------------------------------------
// RetentionConfig / ScheduleConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_retention_days() -> u32 {
    30
}

pub fn default_schedule_enabled() -> bool {
    true
}

pub fn default_detect_interval_secs() -> u64 {
    3_600
}

pub fn default_escalate_interval_secs() -> u64 {
    6 * 3_600
}

pub fn default_purge_interval_secs() -> u64 {
    86_400
}

// ---------------------------------------------------------------------------
// LoggingConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "info,ipwarden=debug".to_string()
}

pub fn default_log_file() -> String {
    "/var/log/ipwarden/ipwarden.log".to_string()
}
