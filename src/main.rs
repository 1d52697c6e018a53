use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use relaunch::admin::{AdminServer, PKG_NAME, VERSION};
use relaunch::config::Config;
use relaunch::health::HttpHealthProbe;
use relaunch::supervisor::Supervisor;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaunch=debug".parse().expect("valid log directive")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;
    let apps = config.validate()?;

    info!(path = %config_path.display(), apps = apps.len(), "configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe = Arc::new(HttpHealthProbe::default());
    let supervisor = Supervisor::new(apps, (config.port_range.from, config.port_range.to), probe);

    if supervisor.ports_exhausted() {
        anyhow::bail!("configured port range is empty");
    }

    supervisor.spawn_apps(shutdown_rx.clone());
    supervisor.bootstrap();

    let auth_token = config.rpc.auth_token.clone().or_else(|| {
        let generated = uuid::Uuid::new_v4().to_string();
        info!(token = %generated, "generated admin API token (no rpc.auth_token configured)");
        Some(generated)
    });

    let admin_addr: SocketAddr = format!("{}:{}", config.rpc.host, config.rpc.port).parse()?;
    let admin_server = AdminServer::new(admin_addr, Arc::clone(&supervisor), shutdown_rx.clone(), auth_token);

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "admin server error");
        }
    });

    info!(name = PKG_NAME, version = VERSION, "relaunch supervisor started");

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    info!("stopping all instances...");
    supervisor.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down...");
    }
}
