//! hermesd — the Hermes daemon.
//!
//! Single binary that assembles the Hermes subsystems:
//! - State store (redb)
//! - Service registry
//! - Health check scheduler
//! - API gateway with periodic route refresh
//!
//! # Usage
//!
//! ```text
//! hermesd serve --config /etc/hermes/hermesd.toml
//! hermesd check-config --config /etc/hermes/hermesd.toml
//! ```

mod bootstrap;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hermes_gateway::{Gateway, RouteSync, gateway_router};
use hermes_health::{HealthCheckScheduler, HealthService, HttpProber};
use hermes_registry::ServiceRegistry;
use hermes_state::{HealthStore, RouteStore, ServiceStore, StateStore};

use crate::config::HermesConfig;

const DEFAULT_LOG_FILTER: &str = "info,hermesd=debug,hermes=debug";

#[derive(Parser)]
#[command(name = "hermesd", about = "Hermes service registry and API gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry, health scheduler, and gateway.
    Serve {
        /// Path to hermesd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Gateway listen address (overrides `server.listen`).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Data directory for persistent state (overrides `storage.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse a config file and print the effective configuration.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
            log_format,
        } => {
            let mut config = match config {
                Some(path) => HermesConfig::from_file(&path)?,
                None => HermesConfig::default(),
            };
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            init_tracing(config.log_level.as_deref(), log_format);
            serve(config).await
        }
        Command::CheckConfig { config } => {
            let config = HermesConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// `RUST_LOG` wins, then the config's `log_level`, then the default.
fn init_tracing(log_level: Option<&str>, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: HermesConfig) -> anyhow::Result<()> {
    info!("Hermes daemon starting");

    let supervisor_interval = config.supervisor_interval()?;
    let refresh_interval = config.route_refresh_interval()?;
    let upstream_timeout = config.upstream_timeout()?;

    // ── Initialize subsystems ──────────────────────────────────

    let data_dir = &config.storage.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("hermes.redb");
    let store = StateStore::open(&db_path)
        .with_context(|| format!("failed to open state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");

    let services: Arc<dyn ServiceStore> = Arc::new(store.clone());
    let checks: Arc<dyn HealthStore> = Arc::new(store.clone());
    let routes: Arc<dyn RouteStore> = Arc::new(store.clone());

    let registry = ServiceRegistry::new(services.clone());
    let health = Arc::new(HealthService::new(
        services.clone(),
        checks,
        Arc::new(HttpProber::new()),
    ));

    bootstrap::bootstrap(&config, &registry, &health, routes.as_ref()).await?;

    let scheduler = HealthCheckScheduler::new(health.clone(), supervisor_interval);
    scheduler.start()?;

    let gateway = Arc::new(Gateway::new(services).with_upstream_timeout(upstream_timeout));
    let route_sync = RouteSync::new(gateway.clone());
    route_sync
        .sync(routes.as_ref())
        .await
        .context("initial route sync failed")?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let refresh_handle = tokio::spawn(refresh_routes(
        route_sync,
        routes,
        refresh_interval,
        shutdown_rx,
    ));

    // ── Start gateway ──────────────────────────────────────────

    let addr = config.server.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "gateway listening");

    let app = gateway_router(gateway).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    scheduler.stop();
    let _ = refresh_handle.await;

    info!("Hermes daemon stopped");
    Ok(())
}

/// Periodically rebuild the gateway route table from the store.
async fn refresh_routes(
    sync: RouteSync,
    store: Arc<dyn RouteStore>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the table was just synced.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = sync.sync(store.as_ref()).await {
                    error!(error = %e, "route refresh failed");
                }
            }
        }
    }
}
