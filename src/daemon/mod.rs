// Process bootstrap: config resolution, data layout, logging and service wiring.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::classifier::UrlClassifier;
use crate::clock::{Clock, SystemClock};
use crate::controller::PollSettings;
use crate::migrate::{ArtifactMigrator, HttpFetcher};
use crate::models::VaultConfig;
use crate::provider::{GenerationProvider, HttpProvider};
use crate::server::{self, AppState};
use crate::storage::{
    open_catalog, CatalogStore, LocalFileBackend, RemoteObjectBackend, StorageBackend,
    TieredStorage,
};

pub const APP_DIR: &str = "artifact-vault";
pub const LOG_FILE_PREFIX: &str = "artifact-vault.log";

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config_file(path: &Path) -> Result<VaultConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: VaultConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the VaultConfig. Resolution order:
///   1. --config CLI flag (passed as config_path)
///   2. VAULT_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/artifact-vault/config.json)
///   4. {data_dir}/config.json
///   5. VaultConfig::default()
///
/// Secrets from the environment are applied afterwards.
pub fn load_config(config_path: Option<&Path>) -> Result<VaultConfig> {
    let mut config = match locate_config(config_path)? {
        Some(path) => read_config_file(&path)?,
        None => {
            tracing::info!("No config file found, using defaults");
            VaultConfig::default()
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

fn locate_config(config_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = config_path {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(dir) = std::env::var("VAULT_CONFIG_DIR") {
        let path = PathBuf::from(dir).join("config.json");
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if let Some(dir) = dirs::config_dir() {
        let path = dir.join(APP_DIR).join("config.json");
        if path.exists() {
            return Ok(Some(path));
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return Ok(Some(path));
    }
    Ok(None)
}

/// Resolve the data directory: explicit override, then `VAULT_DATA_DIR`,
/// then the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("VAULT_DATA_DIR") {
        if !d.trim().is_empty() {
            return PathBuf::from(d);
        }
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Data directory for `config`, honouring a CLI override first.
pub fn effective_data_dir(config: &VaultConfig, override_dir: Option<&Path>) -> PathBuf {
    match (override_dir, config.data_dir.as_deref()) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(dir)) => dir.to_path_buf(),
        (None, None) => resolve_data_dir(None),
    }
}

pub fn public_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("public")
}

pub fn catalog_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("database")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Create the required data directories under `data_dir`.
pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    for dir in [
        data_dir.to_path_buf(),
        public_dir(data_dir).join(crate::storage::local::GENERATED_DIR),
        catalog_dir(data_dir),
        logs_dir(data_dir),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    tracing::debug!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Console logging for one-shot commands. Quiet unless `--verbose` or
/// `RUST_LOG` asks for more.
pub fn init_console_logging(verbose: bool) {
    let filter = if verbose || std::env::var("RUST_LOG").is_ok() {
        env_filter(verbose)
    } else {
        EnvFilter::new("warn")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Console plus a daily rolling file under `log_dir`. The returned guard
/// must be held for the lifetime of the process.
pub fn init_server_logging(verbose: bool, log_dir: &Path) -> Option<WorkerGuard> {
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let result = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init();

    match result {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Service wiring
// ---------------------------------------------------------------------------

/// Everything the server and the CLI commands need, built once from config.
pub struct Services {
    pub config: Arc<VaultConfig>,
    pub data_dir: PathBuf,
    pub provider: Arc<dyn GenerationProvider>,
    pub migrator: Arc<ArtifactMigrator>,
    pub catalog: Arc<dyn CatalogStore>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.config.poll_interval_ms),
            max_attempts: self.config.max_poll_attempts,
        }
    }

    pub fn public_dir(&self) -> PathBuf {
        public_dir(&self.data_dir)
    }

    pub fn into_state(self) -> Arc<AppState> {
        let public_dir = self.public_dir();
        Arc::new(AppState {
            config: self.config,
            provider: self.provider,
            migrator: self.migrator,
            catalog: self.catalog,
            clock: self.clock,
            public_dir,
            start_time: Instant::now(),
            jobs: RwLock::new(HashMap::new()),
        })
    }
}

/// Storage chain in durability order: remote object store when configured,
/// local files, then memory (appended by `TieredStorage`).
pub fn build_tiers(config: &VaultConfig, data_dir: &Path) -> Vec<Arc<dyn StorageBackend>> {
    let mut tiers: Vec<Arc<dyn StorageBackend>> = Vec::new();

    if config.remote.is_configured() {
        match RemoteObjectBackend::new(&config.remote) {
            Ok(remote) => tiers.push(Arc::new(remote)),
            Err(e) => tracing::warn!("Remote object tier disabled: {:#}", e),
        }
    } else {
        tracing::debug!("Remote object tier not configured");
    }

    tiers.push(Arc::new(LocalFileBackend::new(&public_dir(data_dir))));
    tiers
}

/// Classifier that also treats this deployment's remote public base as durable.
pub fn build_classifier(config: &VaultConfig) -> UrlClassifier {
    let classifier = UrlClassifier::new(&config.classifier);
    if !config.remote.is_configured() {
        return classifier;
    }
    match RemoteObjectBackend::new(&config.remote) {
        Ok(remote) => classifier.with_durable_prefix(remote.public_base().to_string()),
        Err(_) => classifier,
    }
}

pub async fn build_services(config: VaultConfig, data_dir: PathBuf) -> Result<Services> {
    create_data_dirs(&data_dir).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = Arc::new(TieredStorage::new(
        build_tiers(&config, &data_dir),
        clock.clone(),
    ));

    let fetcher = HttpFetcher::new(
        Duration::from_secs(config.download_timeout_secs),
        config.max_download_bytes,
    )
    .context("Failed to build download client")?;

    let migrator = Arc::new(ArtifactMigrator::new(
        build_classifier(&config),
        Arc::new(fetcher),
        storage,
        clock.clone(),
    ));

    let provider =
        HttpProvider::new(config.provider.clone()).context("Failed to build provider client")?;

    let catalog = open_catalog(catalog_dir(&data_dir), config.max_backups).await;

    Ok(Services {
        config: Arc::new(config),
        data_dir,
        provider: Arc::new(provider),
        migrator,
        catalog,
        clock,
    })
}

/// Probe each tier and log the result. Never fails; a broken tier is skipped
/// at write time anyway.
pub async fn log_tier_probes(storage: &TieredStorage) {
    for probe in storage.probe_all().await {
        match (&probe.error, probe.ok) {
            (_, true) => tracing::info!("Storage tier '{}' ready", probe.tier),
            (Some(err), false) => {
                tracing::warn!("Storage tier '{}' unavailable: {}", probe.tier, err)
            }
            (None, false) => tracing::warn!("Storage tier '{}' unavailable", probe.tier),
        }
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

/// Run the HTTP server until Ctrl+C or SIGTERM.
pub async fn serve(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
    verbose: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = effective_data_dir(&config, data_dir_override);
    config.data_dir = Some(data_dir.clone());
    create_data_dirs(&data_dir).await?;
    let _log_guard = init_server_logging(verbose, &logs_dir(&data_dir));

    let bind_addr = format!("{}:{}", config.host, config.port);
    let services = build_services(config, data_dir.clone()).await?;
    log_tier_probes(services.migrator.storage()).await;
    if !services.catalog.is_persistent() {
        tracing::warn!("Catalog is in-memory only; changes will be lost on restart");
    }

    let state = services.into_state();
    let router = server::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    tracing::info!(
        "artifact-vault {} listening on http://{} (data dir: {})",
        env!("CARGO_PKG_VERSION"),
        bind_addr,
        data_dir.display()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    cancel_all_jobs(&state).await;
    tracing::info!("Server exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received Ctrl+C signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C signal");
    }
}

/// Cancel every job still in flight. Returns how many were active.
pub async fn cancel_all_jobs(state: &AppState) -> usize {
    let jobs = state.jobs.read().await;
    let mut cancelled = 0;
    for (id, controller) in jobs.iter() {
        if !controller.status().is_terminal() {
            controller.cancel();
            tracing::info!("Cancelled job {} on shutdown", id);
            cancelled += 1;
        }
    }
    cancelled
}
