//! uwsd: the UWS orchestrator daemon.
//!
//! Single binary that assembles the health supervisor:
//! - Status store (redb)
//! - Service registry and health state machine
//! - Probe scheduler
//! - Restart controller + command lifecycle
//! - Metrics exporter
//! - REST API
//!
//! # Usage
//!
//! ```text
//! uwsd run --config uws.toml --port 8800 --data-dir /var/lib/uws
//! uwsd check-config --config uws.toml
//! ```

mod lifecycle;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use uws_core::{OrchestratorConfig, ResolvedService};
use uws_health::{HealthMonitor, HttpProber, RestartController, ServiceRegistry};
use uws_metrics::MetricsExporter;
use uws_state::{HealthPolicy, ServiceDescriptor, StatusStore};

use crate::lifecycle::CommandLifecycle;

const DEFAULT_LOG_FILTER: &str = "info,uwsd=debug,uws=debug";

#[derive(Parser)]
#[command(name = "uwsd", about = "UWS orchestrator daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor every configured service and serve the status API.
    Run {
        /// Path to uws.toml.
        #[arg(long, default_value = "uws.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8800")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/uws")]
        data_dir: PathBuf,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        /// Path to uws.toml.
        #[arg(long, default_value = "uws.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => run(&config, port, &data_dir).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Build the initial descriptor for a configured service.
fn descriptor(svc: &ResolvedService) -> ServiceDescriptor {
    ServiceDescriptor::new(
        svc.id.as_str(),
        svc.name.as_str(),
        svc.health_url.as_str(),
        svc.poll_interval.as_millis() as u64,
        svc.probe_timeout.as_millis() as u64,
        HealthPolicy {
            failure_threshold: svc.failure_threshold,
            success_threshold: svc.success_threshold,
            initial_success_threshold: svc.initial_success_threshold,
            backoff_base_ms: svc.backoff_base.as_millis() as u64,
            backoff_max_ms: svc.backoff_max.as_millis() as u64,
            max_restart_attempts: svc.max_restart_attempts,
        },
    )
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let orchestrator = config.orchestrator()?;
    let services = config.services()?;

    println!(
        "{}: ok ({} services, {} concurrent probes)",
        path.display(),
        services.len(),
        orchestrator.max_concurrent_probes
    );
    for svc in &services {
        println!(
            "  {:<12} {:<40} every {:?}, timeout {:?}, max {} restarts",
            svc.id, svc.health_url, svc.poll_interval, svc.probe_timeout, svc.max_restart_attempts
        );
    }
    Ok(())
}

async fn run(config_path: &Path, port: u16, data_dir: &Path) -> anyhow::Result<()> {
    info!("UWS orchestrator starting");

    let config = OrchestratorConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let orchestrator = config.orchestrator()?;
    let services = config.services()?;
    info!(path = %config_path.display(), services = services.len(), "configuration loaded");

    // Ensure data directory exists.
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("uws.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // Status store.
    let store = StatusStore::open(&db_path)?;
    let keep: HashSet<String> = services.iter().map(|s| s.id.clone()).collect();
    let pruned = store.retain(&keep)?;
    info!(path = ?db_path, pruned, "status store opened");

    // Metrics exporter.
    let metrics = Arc::new(MetricsExporter::new());

    // Service registry.
    let (registry, events) = ServiceRegistry::new(store.clone(), Arc::clone(&metrics));
    let registry = Arc::new(registry);
    for svc in &services {
        registry.register(descriptor(svc)).await?;
    }

    // Restart controller.
    let lifecycle = Arc::new(CommandLifecycle::from_services(&services));
    for svc in &services {
        if !lifecycle.has_command(&svc.id) {
            warn!(service_id = %svc.id, "no restart_command configured, restarts will fail");
        }
    }
    let controller = Arc::new(
        RestartController::new(Arc::clone(&registry), lifecycle, Arc::clone(&metrics))
            .with_restart_timeout(orchestrator.restart_timeout)
            .with_shutdown_grace(orchestrator.shutdown_grace),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let controller_handle = tokio::spawn(controller.run(events, shutdown_rx));

    let mut monitor = HealthMonitor::new(
        Arc::clone(&registry),
        Arc::new(HttpProber::new()),
        Arc::clone(&metrics),
        orchestrator.max_concurrent_probes,
    );
    if let Some(wait) = orchestrator.pool_wait_timeout {
        monitor = monitor.with_pool_wait_timeout(wait);
    }
    let started = monitor.start_all().await?;
    info!(
        monitors = started,
        max_concurrent_probes = orchestrator.max_concurrent_probes,
        "health monitors started"
    );

    // ── Start API server ───────────────────────────────────────

    let router = uws_api::build_router(uws_api::ApiState {
        store,
        registry,
        metrics,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Stop probing, then let the controller drain.
    monitor.shutdown(orchestrator.shutdown_grace).await;
    if let Err(e) = controller_handle.await {
        error!(error = %e, "restart controller task failed");
    }

    info!("UWS orchestrator stopped");
    Ok(())
}
