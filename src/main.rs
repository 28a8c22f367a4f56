mod admin_api;
mod analytics;
mod cli;
mod config;
mod models;
mod protection;
mod proxy;
mod storage;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admin_api::routes::AppState;
use crate::admin_api::server::AdminApiServer;
use crate::analytics::alerting::AlertManager;
use crate::analytics::retention::RetentionJob;
use crate::analytics::scheduler::{JobRunner, Scheduler};
use crate::cli::{Cli, Command};
use crate::config::settings::{LoggingConfig, Settings, StorageBackend};
use crate::protection::anomaly::AnomalyDetector;
use crate::protection::auto_ban::AutoEscalator;
use crate::protection::blocklist::BlockRegistry;
use crate::protection::gate::RequestGate;
use crate::protection::geoip::{build_provider, GeoResolver};
use crate::proxy::http_handler::HttpHandler;
use crate::proxy::server::ProxyServer;
use crate::storage::cache::DecisionCache;
use crate::storage::memory::MemoryStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::{FlagStore, LogStore, Store};

/// Initialise the `tracing` subscriber with stdout and, when configured, a
/// non-blocking file writer. The returned guard must outlive the program.
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info,ipwarden=debug"));

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true);

    let (file_layer, guard) = match file_writer(&logging.file) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

fn file_writer(path: &str) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if path.is_empty() {
        return None;
    }
    let path = Path::new(path);
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path.file_name()?;
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Cannot create log directory {}: {}", dir.display(), e);
        return None;
    }
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}

/// One-shot commands only report problems on stderr.
fn init_cli_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

/// Everything shared between the gateway, the admin API and the CLI.
struct Components {
    log: Arc<dyn LogStore>,
    flags: Arc<dyn FlagStore>,
    cache: Arc<DecisionCache>,
    registry: Arc<BlockRegistry>,
    jobs: Arc<JobRunner>,
}

fn wire<S: Store + 'static>(store: Arc<S>, settings: &Settings) -> Components {
    let cache = Arc::new(DecisionCache::new(settings.cache.ttls()));
    let registry = Arc::new(BlockRegistry::new(store.clone(), cache.clone()));

    let alerting = AlertManager::from_config(&settings.alerting).map(Arc::new);
    if alerting.is_some() {
        info!("Alerting enabled");
    }

    let detector = AnomalyDetector::new(
        store.clone(),
        store.clone(),
        registry.clone(),
        &settings.detection,
    );
    let escalator = AutoEscalator::new(store.clone(), registry.clone(), alerting, &settings.escalation);
    let retention = RetentionJob::new(store.clone(), &settings.retention);
    let jobs = Arc::new(JobRunner::new(detector, escalator, retention));

    Components {
        log: store.clone(),
        flags: store,
        cache,
        registry,
        jobs,
    }
}

fn open_components(settings: &Settings) -> Result<Components> {
    match settings.storage.backend {
        StorageBackend::Sqlite => {
            let path = &settings.storage.sqlite_path;
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
            }
            let store = SqliteStore::new(path)
                .with_context(|| format!("Failed to open SQLite store at {}", path))?;
            info!(path = %path, "SQLite store opened");
            Ok(wire(Arc::new(store), settings))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; data is lost on restart");
            Ok(wire(Arc::new(MemoryStore::new()), settings))
        }
    }
}

async fn serve(settings: Settings, config_path: &str) -> Result<()> {
    info!("Starting ipwarden");
    info!("Config loaded from {}", config_path);

    let components = open_components(&settings)?;

    // ---------------------------------------------------------------
    // Request path
    // ---------------------------------------------------------------
    let resolver = Arc::new(GeoResolver::new(
        build_provider(&settings.geolocation),
        components.cache.clone(),
        Duration::from_millis(settings.geolocation.timeout_ms),
    ));
    let gate = Arc::new(RequestGate::new(
        components.registry.clone(),
        components.cache.clone(),
        resolver,
        components.log.clone(),
        &settings.gate,
    ));
    let handler = Arc::new(HttpHandler::new(gate, &settings.server));
    let proxy_server = ProxyServer::new(&settings.server, handler);

    // ---------------------------------------------------------------
    // Admin API
    // ---------------------------------------------------------------
    let admin_server = if settings.admin_api.enabled {
        if settings.admin_api.api_key.is_empty() {
            warn!("admin_api.api_key is empty; every admin request will be rejected");
        }
        let state = AppState {
            registry: components.registry.clone(),
            flags: components.flags.clone(),
            log: components.log.clone(),
            cache: components.cache.clone(),
            jobs: components.jobs.clone(),
            start_time: Instant::now(),
            api_key: settings.admin_api.api_key.clone(),
        };
        Some(AdminApiServer::new(state, settings.admin_api.bind.clone()))
    } else {
        info!("Admin API disabled");
        None
    };

    let scheduler = Scheduler::new(
        components.jobs.clone(),
        components.cache.clone(),
        &settings.schedule,
        &settings.cache,
    );

    // ---------------------------------------------------------------
    // Spawn everything
    // ---------------------------------------------------------------
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("Proxy server error: {:#}", e);
        }
    });

    let admin_handle = admin_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Admin API server error: {:#}", e);
            }
        })
    });

    let scheduler_handle = tokio::spawn(async move {
        scheduler.run().await;
    });

    info!("ipwarden is running. Press Ctrl+C to shut down.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down ipwarden...");

    proxy_handle.abort();
    if let Some(handle) = admin_handle {
        handle.abort();
    }
    scheduler_handle.abort();

    info!("ipwarden shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config_path = args.config_path().to_string();

    let settings = if args.config_is_explicit() {
        Settings::load(&config_path)?
    } else {
        Settings::load_or_default(&config_path)?
    };

    let command = args.command();
    if command == Command::Serve {
        let _guard = init_tracing(&settings.logging);
        return serve(settings, &config_path).await;
    }

    init_cli_tracing();
    let components = open_components(&settings)?;
    let output = cli::run_command(&command, &components.registry, &components.jobs)?;
    print!("{}", output);
    Ok(())
}
