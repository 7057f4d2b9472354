//! Command line of the `clilogger` server.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Configuration, DEFAULT_PORT};
use crate::server::ServiceInfo;

#[derive(Parser, Debug)]
#[command(name = "clilogger")]
#[command(about = "Receive and display log entries streamed from the local network", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Service name to publish (defaults to the configured name, then the host name)
    pub service_name: Option<String>,

    /// Port to listen on (defaults to the configured port, then automatic)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Configuration file
    #[arg(short, long, env = "CLILOGGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Show internal trace logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Configuration::default_path)
    }

    /// Flag, then configuration, then host name.
    pub fn service_name(&self, config: &Configuration) -> String {
        self.service_name
            .clone()
            .or_else(|| config.service_name.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(ServiceInfo::default_name)
    }

    /// Flag, then configuration, then automatic.
    pub fn port(&self, config: &Configuration) -> u16 {
        self.port.or(config.service_port).unwrap_or(DEFAULT_PORT)
    }
}

/// Install the stderr diagnostics subscriber. `RUST_LOG` wins over
/// `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
