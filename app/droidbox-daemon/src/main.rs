use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use droidbox_core::{Config, HealthMonitor, InstanceManager};
use droidbox_net::HostRunner;
use droidbox_runtime::{DockerRuntime, SandboxRuntime};

#[derive(Debug, Parser)]
#[command(name = "droidboxd")]
#[command(author, version, about = "Sandboxed Android instance daemon", long_about = None)]
struct DaemonArgs {
    /// Configuration file (default: /etc/droidbox/config.toml, then
    /// ~/.config/droidbox/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for droidbox (overrides the configuration file).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives(&config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(config).await
}

fn default_directives(level: &str) -> String {
    ["droidbox_core", "droidbox_net", "droidbox_runtime", "droidbox_daemon"]
        .map(|target| format!("{target}={level}"))
        .join(",")
}

async fn run(config: Config) -> Result<()> {
    info!("starting droidboxd");

    std::fs::create_dir_all(&config.data_dir).context("failed to create data directory")?;
    std::fs::create_dir_all(config.instances_dir())
        .context("failed to create instances directory")?;
    std::fs::create_dir_all(config.routing_state_dir())
        .context("failed to create routing state directory")?;
    let pid_file = config.pid_file();
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("failed to write PID file")?;

    let runtime: Arc<dyn SandboxRuntime> = match &config.runtime.socket_path {
        Some(path) => Arc::new(
            DockerRuntime::with_socket(&path.to_string_lossy())
                .context("failed to build engine client")?,
        ),
        None => Arc::new(DockerRuntime::from_env().context("failed to build engine client")?),
    };
    runtime
        .ping()
        .await
        .context("container engine is not reachable")?;

    let runner = Arc::new(HostRunner::new());
    let manager = InstanceManager::new(&config, Arc::clone(&runtime), runner)
        .context("failed to build instance manager")?;
    if let Err(e) = manager.enable_ip_forward() {
        warn!(error = %e, "could not enable IPv4 forwarding; isolated egress may not work");
    }

    info!(
        data_dir = %config.data_dir.display(),
        subnet = %config.network.subnet,
        "instance manager ready"
    );

    let monitor = if config.monitor.enabled {
        let monitor = HealthMonitor::new(manager.clone(), &config.monitor);
        Some(tokio::spawn(monitor.run()))
    } else {
        info!("health monitor disabled");
        None
    };

    println!("droidbox daemon started");
    println!("  Data: {}", config.data_dir.display());
    println!("Press Ctrl+C to stop.");

    shutdown_signal().await;
    info!("shutdown signal received");

    if let Some(task) = monitor {
        task.abort();
    }

    if let Err(e) = std::fs::remove_file(&pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove PID file {}: {}", pid_file.display(), e);
        }
    }

    info!("droidboxd stopped");
    Ok(())
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
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
