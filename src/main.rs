use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use forge::api::{start_server, AppState};
use forge::bus::StreamBus;
use forge::concurrency::ConcurrencyManager;
use forge::credentials::{CredentialProvider, StaticCredentialProvider};
use forge::driver::{ContainerDriver, LocalProcessDriver, WorkerDriver};
use forge::queue::QueueManager;
use forge::settings::{DriverMode, Settings, StoreBackend};
use forge::store::memory::MemoryStore;
use forge::store::Store;
use forge::watcher::FeatureWatcher;
use forge::work_session::WorkSessionManager;

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "Autonomous software-engineering pipeline orchestrator control-plane")]
pub struct Cli {
    /// Path to a forge.toml config file, layered over the built-in defaults
    /// and under FORGE_* environment overrides.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control-plane HTTP surface and background loops. Default
    /// command when none is given.
    Serve {
        /// Overrides the configured bind address for this run only.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the fully resolved settings (defaults + config file + env) and
    /// exit without starting anything.
    PrintConfig,
    /// Query a running control plane's `/health` endpoint.
    Health,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => serve(settings, bind).await,
        Commands::PrintConfig => {
            println!("{settings:#?}");
            Ok(())
        }
        Commands::Health => health_check(&settings.bind_address).await,
    }
}

/// Best-effort `GET /health` against an already-running control plane,
/// printing the response body and exiting non-zero if it cannot be reached.
async fn health_check(bind_address: &str) -> Result<()> {
    let url = format!("http://{bind_address}/health");
    let body = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .text()
        .await
        .context("failed to read health response body")?;
    println!("{body}");
    Ok(())
}

/// Wires every component per §2/§4 and blocks until a shutdown signal is
/// received, then drains in-flight work within the configured grace period.
async fn serve(mut settings: Settings, bind_override: Option<String>) -> Result<()> {
    if let Some(bind) = bind_override {
        settings.bind_address = bind;
    }

    let store: Arc<dyn Store> = match settings.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let driver: Arc<dyn WorkerDriver> = match settings.driver_mode {
        DriverMode::Local => Arc::new(LocalProcessDriver::new(
            settings.worker_entrypoint.clone(),
            settings.worker_working_dir.clone(),
        )),
        DriverMode::Container => match ContainerDriver::new(settings.container_image.clone()).await {
            Some(driver) => Arc::new(driver),
            None => {
                warn!(
                    target: "main",
                    "FORGE_DRIVER_MODE=container requested but the Docker daemon is unreachable; \
                     falling back to the local-process driver"
                );
                Arc::new(LocalProcessDriver::new(
                    settings.worker_entrypoint.clone(),
                    settings.worker_working_dir.clone(),
                ))
            }
        },
    };

    let bus = StreamBus::new();
    bus.spawn_sweeper(Duration::from_secs(60));

    let concurrency = Arc::new(ConcurrencyManager::new());
    let queue = QueueManager::new(store.clone());
    let work_sessions = WorkSessionManager::new(store.clone(), driver.clone(), bus.clone(), queue.clone())
        .with_inactivity_timeout(settings.work_session_inactivity_timeout);
    queue.attach_work_sessions(work_sessions.clone());

    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(StaticCredentialProvider::new(settings.issue_tracker_token.clone()));

    let watcher = Arc::new(FeatureWatcher::new(
        store.clone(),
        driver.clone(),
        bus.clone(),
        concurrency.clone(),
        credentials.clone(),
        settings.watcher_config(),
    ));
    let watcher_handle = watcher.start();

    let state = Arc::new(AppState {
        store,
        driver,
        bus,
        concurrency,
        queue,
        work_sessions: work_sessions.clone(),
        credentials,
        limits: settings.limits,
        monitor: settings.monitor,
        started_at: Instant::now(),
    });

    info!(target: "main", bind = %settings.bind_address, driver_mode = ?settings.driver_mode, "starting control plane");
    let result = start_server(&settings.bind_address, state).await;

    watcher.stop();
    if let Some(handle) = watcher_handle {
        handle.abort();
    }

    info!(target: "main", grace_period = ?settings.shutdown_grace_period, "draining active work sessions");
    match tokio::time::timeout(settings.shutdown_grace_period, work_sessions.cleanup()).await {
        Ok(()) => info!(target: "main", "work sessions drained cleanly"),
        Err(_) => warn!(target: "main", "shutdown grace period elapsed before all work sessions drained"),
    }

    if let Err(e) = &result {
        error!(target: "main", error = %e, "server exited with an error");
    }
    result
}
