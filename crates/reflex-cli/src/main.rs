//! reflex CLI
//!
//! Gathers local and server-reflexive candidates for a UDP port.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use reflex_discovery::{
    DiscoveryStatus, Port, PortEvent, PortHandle, TokioResolver, spawn_port,
};
use reflex_transport::TokioSocketFactory;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;

/// reflex - find out how peers can reach this host
#[derive(Parser)]
#[command(name = "reflex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "reflex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind a port and print its candidates
    Gather(GatherArgs),

    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Default)]
struct GatherArgs {
    /// STUN server, host[:port]
    #[arg(long)]
    server: Option<String>,

    /// Server tried when the primary does not answer
    #[arg(long)]
    fallback: Option<String>,

    /// local-only, prefer-stun or require-stun
    #[arg(long)]
    policy: Option<String>,

    /// Interface address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Lowest local port
    #[arg(long)]
    min_port: Option<u16>,

    /// Highest local port
    #[arg(long)]
    max_port: Option<u16>,

    /// Give up gathering after this many seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,
}

impl GatherArgs {
    /// Flags override file values
    fn apply(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.stun.server = Some(server.clone());
        }
        if let Some(fallback) = &self.fallback {
            config.stun.fallback = Some(fallback.clone());
        }
        if let Some(policy) = &self.policy {
            config.stun.policy = policy.clone();
        }
        if let Some(bind) = self.bind {
            config.port.bind = bind;
        }
        if let Some(min_port) = self.min_port {
            config.port.min_port = min_port;
        }
        if let Some(max_port) = self.max_port {
            config.port.max_port = max_port;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Commands::Gather(args) = &cli.command {
        args.apply(&mut config);
    }

    init_logging(cli.verbose, &config.logging.level);
    config.validate()?;

    match cli.command {
        Commands::Gather(args) => gather(&config, Duration::from_secs(args.timeout)).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `-v` or the configured level
fn init_logging(verbose: bool, level: &str) {
    let default_level = if verbose { "debug" } else { level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Gather candidates and print them as they arrive
async fn gather(config: &Config, limit: Duration) -> anyhow::Result<()> {
    let port = Port::create(config.port_config()?, &TokioSocketFactory)
        .context("failed to open UDP port")?;
    let mut handle = spawn_port(port, Arc::new(TokioResolver), config.driver_config());

    println!("Local port: {}", handle.local_address());
    handle
        .prepare_address()
        .await
        .context("failed to start gathering")?;

    if tokio::time::timeout(limit, print_candidates(&mut handle))
        .await
        .is_err()
    {
        tracing::warn!("Gathering did not complete within {:?}", limit);
    }

    let status = handle.discovery_status().await?;
    println!("Discovery: {}", describe(status));
    handle.close().await?;
    Ok(())
}

async fn print_candidates(handle: &mut PortHandle) {
    while let Some(event) = handle.next_event().await {
        match event {
            PortEvent::CandidateReady(candidate) => println!("{}", candidate.to_sdp_string()),
            PortEvent::DiscoveryFailed(failure) => {
                tracing::warn!("Server-reflexive discovery failed: {}", failure);
            }
            PortEvent::GatheringComplete => break,
            PortEvent::SocketClosed(code) => {
                tracing::error!("Socket closed with error {}", code);
                break;
            }
            PortEvent::Packet { remote, .. } => {
                tracing::debug!("Ignoring datagram from {}", remote);
            }
        }
    }
}

fn describe(status: DiscoveryStatus) -> String {
    match status {
        DiscoveryStatus::NotStarted => "not started".to_string(),
        DiscoveryStatus::InProgress => "still in progress".to_string(),
        DiscoveryStatus::Succeeded(mapped) => format!("mapped to {mapped}"),
        DiscoveryStatus::Failed(failure) => format!("failed ({failure})"),
        DiscoveryStatus::NotApplicable => "not attempted".to_string(),
    }
}
