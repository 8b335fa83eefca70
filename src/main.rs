//! hookrelay - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hookrelay::{
    cli::Cli,
    config::RelayConfig,
    error::StartupError,
    lifecycle::Lifecycle,
    mode::{Components, Mode, prepare},
    relay::Relay,
    sandbox::{DockerProvisioner, docker::connect_docker},
    server::RelayServer,
    source::GitResolver,
    tunnel::DockerTunnelManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();
    let mut config = RelayConfig::from_env()?;
    cli.apply(&mut config);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hookrelay=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .init();
    }

    let mode = Mode::from_hooks_path(config.hooks_path.as_deref())?;
    tracing::info!(mode = mode.name(), "Starting hookrelay");

    let lifecycle = Arc::new(Lifecycle::new());
    let signals = Arc::clone(&lifecycle);
    tokio::spawn(async move {
        if let Err(e) = signals.watch_signals().await {
            tracing::error!(error = %e, "Failed to watch for shutdown signals");
        }
    });

    let docker = connect_docker().await?;
    let components = Components {
        provisioner: Arc::new(DockerProvisioner::new(
            docker.clone(),
            config.sandbox.clone(),
        )),
        tunnels: Arc::new(
            DockerTunnelManager::new(docker, config.tunnel.clone())
                .map_err(StartupError::HttpClient)?,
        ),
        resolver: Arc::new(GitResolver::new(&config.source)),
        relay: Relay::new().map_err(StartupError::HttpClient)?,
    };

    let prepared = match prepare(mode, components, &config, Arc::clone(&lifecycle)).await {
        Ok(prepared) => prepared,
        Err(StartupError::Interrupted) => {
            tracing::info!("Shutdown requested during startup");
            lifecycle.drain().await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut server = RelayServer::new(config.listen_addr, prepared.router);
    if let Err(e) = server.start(lifecycle.cancelled()).await {
        lifecycle.shutdown().await;
        lifecycle.drain().await;
        return Err(e.into());
    }

    server.wait().await;
    lifecycle.shutdown().await;
    lifecycle.drain().await;

    tracing::info!("hookrelay stopped");
    Ok(())
}
