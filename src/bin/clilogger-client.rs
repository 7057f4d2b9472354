//! clilogger-client - send log entries to a clilogger server.
//!
//! Messages come from the command line or, when none are given, one per
//! line from stdin.

use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use clilogger::cli::init_tracing;
use clilogger::client::{
    ClientConfig, LoggingClient, SelectionPolicy, ServiceCandidate, StaticDiscovery,
};
use clilogger::protocol::{Identity, Severity};

#[derive(Parser, Debug)]
#[command(name = "clilogger-client")]
#[command(about = "Send log entries to a clilogger server", long_about = None)]
#[command(version)]
struct Args {
    /// Message to send; read from stdin when omitted
    message: Vec<String>,

    /// Known server as NAME=ADDR[,ADDR...], addresses in preference order
    #[arg(long = "server", value_name = "NAME=ADDRS", required = true, value_parser = parse_server)]
    servers: Vec<(String, Vec<SocketAddr>)>,

    /// Severity of every message
    #[arg(short, long, default_value = "info")]
    severity: Severity,

    /// Host name announced to the server
    #[arg(long)]
    name: Option<String>,

    /// Shared secret expected by the server
    #[arg(long, env = "CLILOGGER_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Prefer this server when several are known
    #[arg(long, conflicts_with = "interactive")]
    prefer: Option<String>,

    /// Ask which server to use when several are known
    #[arg(short, long, requires = "message")]
    interactive: bool,

    /// Seconds to wait for every message to be acknowledged
    #[arg(long, default_value_t = 10)]
    wait: u64,

    /// Show internal trace logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_server(s: &str) -> std::result::Result<(String, Vec<SocketAddr>), String> {
    let (name, addrs) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDR[,ADDR...], got '{}'", s))?;
    if name.trim().is_empty() {
        return Err("server name is empty".to_string());
    }
    let addrs = addrs
        .split(',')
        .map(|a| a.trim().parse().map_err(|e| format!("bad address '{}': {}", a, e)))
        .collect::<std::result::Result<Vec<SocketAddr>, String>>()?;
    Ok((name.trim().to_string(), addrs))
}

/// List the candidates on stderr and read a choice from stdin. An empty or
/// invalid answer aborts the attempt.
fn prompt(candidates: &[ServiceCandidate]) -> Option<usize> {
    let mut stderr = std::io::stderr();
    for (i, candidate) in candidates.iter().enumerate() {
        let _ = writeln!(stderr, "  [{}] {}", i + 1, candidate.name);
    }
    let _ = write!(stderr, "Connect to: ");
    let _ = stderr.flush();

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer).ok()?;
    let choice: usize = answer.trim().parse().ok()?;
    choice.checked_sub(1)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let discovery = args
        .servers
        .iter()
        .fold(StaticDiscovery::new(), |d, (name, addrs)| {
            d.with_service(name.clone(), addrs.clone())
        });

    let mut identity = Identity::local().with_secret(args.secret.clone());
    if let Some(name) = &args.name {
        identity.rename(name.clone());
    }
    let selection = if args.interactive {
        SelectionPolicy::Custom(Arc::new(prompt))
    } else if let Some(name) = &args.prefer {
        SelectionPolicy::PreferName(name.clone())
    } else {
        SelectionPolicy::First
    };
    let config = ClientConfig {
        selection,
        identity,
        ..Default::default()
    };
    let client = LoggingClient::start(config, Arc::new(discovery));

    if args.message.is_empty() {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
            if !line.is_empty() {
                client.log(line, args.severity);
            }
        }
    } else {
        let parts: Vec<&str> = args.message.iter().map(String::as_str).collect();
        client.log_parts(&parts, args.severity);
    }

    let drained = tokio::time::timeout(Duration::from_secs(args.wait), client.wait_drained()).await;
    let pending = client.pending();
    let status = client.status();
    client.shutdown().await;

    if drained.is_err() {
        if !status.rejected.is_empty() {
            warn!(rejected = ?status.rejected, "Identity was rejected");
        }
        bail!("{} entries not acknowledged after {}s", pending, args.wait);
    }
    info!(peer = ?status.peer, "All entries delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server() {
        let (name, addrs) = parse_server("desk=127.0.0.1:4000, 10.0.0.2:4000").unwrap();
        assert_eq!(name, "desk");
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:4000".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:4000".parse().unwrap()
            ]
        );

        assert!(parse_server("desk").is_err());
        assert!(parse_server("=127.0.0.1:1").is_err());
        assert!(parse_server("desk=nowhere").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "clilogger-client",
            "--server",
            "desk=127.0.0.1:4000",
            "--severity",
            "warn",
            "disk",
            "full",
        ])
        .unwrap();
        assert_eq!(args.severity, Severity::Warning);
        assert_eq!(args.message, vec!["disk", "full"]);
        assert_eq!(args.servers.len(), 1);

        assert!(Args::try_parse_from(["clilogger-client", "hello"]).is_err());
        assert!(Args::try_parse_from(["clilogger-client", "--server", "a=127.0.0.1:1", "-i"]).is_err());
    }
}
