//! clilogger - receive log entries from clients on the local network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use clilogger::cli::{init_tracing, Cli};
use clilogger::client::StaticDiscovery;
use clilogger::config::{Configuration, LiveConfig};
use clilogger::server::{
    ConsoleHandler, LocalPublisher, LoggingServer, PublishEvent, ServerConfig, ServiceInfo,
    ServicePublisher,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let path = cli.config_path();
    let config = match &path {
        Some(path) => Configuration::load_or_init(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => Configuration::default(),
    };
    let name = cli.service_name(&config);
    let port = cli.port(&config);
    info!(
        config = %path.as_ref().map_or("none".into(), |p| p.display().to_string()),
        name = %name,
        "Starting clilogger"
    );

    let live = LiveConfig::new(config, path);
    let handler = Arc::new(ConsoleHandler::new(live.clone(), !cli.no_color));
    let server_config = ServerConfig {
        bind: SocketAddr::new(cli.bind, port),
        ..Default::default()
    };
    let server = LoggingServer::bind(server_config, handler)
        .await
        .with_context(|| format!("failed to listen on port {}", port))?;
    let addr = server.local_addr()?;

    let publisher = LocalPublisher::new(StaticDiscovery::new(), vec![advertised(addr)]);
    let mut events = publisher.publish(ServiceInfo::new(name.clone(), addr.port()));
    match events.recv().await {
        Some(PublishEvent::Published { name, port }) => {
            info!("Service '{}' is up on port {}", name, port);
        }
        Some(PublishEvent::PublishFailed(reason)) => {
            bail!("failed to publish service '{}': {}", name, reason)
        }
        None => bail!("publisher for '{}' went away", name),
    }

    reload_on_hangup(live)?;
    server.run(shutdown_signal()).await?;
    publisher.unpublish();
    Ok(())
}

/// Address clients should resolve the service to.
fn advertised(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted, shutting down"),
        Err(e) => {
            warn!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Re-read the configuration file on SIGHUP.
#[cfg(unix)]
fn reload_on_hangup(live: LiveConfig) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to register SIGHUP")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(e) = live.reload() {
                warn!("Keeping current configuration: {}", e);
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn reload_on_hangup(_live: LiveConfig) -> Result<()> {
    Ok(())
}
