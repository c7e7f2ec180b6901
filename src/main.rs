//! Backup Orchestration Service
//!
//! Serves the HTTP control surface and runs scheduled backups.

// backuptool/src/main.rs
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use which::which;

use backuptool::config::{self, AppConfig};
use backuptool::orchestrator::Orchestrator;
use backuptool::repo::ResticRepository;
use backuptool::scheduler;
use backuptool::server;
use backuptool::snapshot::ZfsSnapshots;
use backuptool::sync::RcloneSync;

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let config_path = config::config_path_from_env();
    let config = AppConfig::load_from_yaml(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;
    if config.targets.is_empty() {
        tracing::warn!("no targets configured; triggers will all answer 404");
    }
    preflight(&config)?;

    let snapshots = Arc::new(ZfsSnapshots::new(config.mount_root.clone()));
    let repository = Arc::new(ResticRepository::new());
    let remote = Arc::new(RcloneSync::new());

    let listen_addr = config.listen_addr.clone();
    let orchestrator = Arc::new(Orchestrator::new(config, snapshots, repository, remote));
    scheduler::spawn_schedules(Arc::clone(&orchestrator));

    let app = server::create_router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context(format!("Failed to bind listen address {listen_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "backup web server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Fails fast when a required external tool is missing, instead of failing
/// the first job that needs it. rclone is only required when some target
/// actually mirrors to a remote.
fn preflight(config: &AppConfig) -> Result<()> {
    which("zfs").context(
        "zfs executable not found in PATH. Please ensure ZFS utilities are installed.",
    )?;
    which("restic").context("restic executable not found in PATH. Please install restic.")?;
    if config.targets.iter().any(|t| t.runs_sync()) {
        which("rclone").context(
            "rclone executable not found in PATH. Please install rclone; a configured target mirrors to a remote.",
        )?;
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
}
