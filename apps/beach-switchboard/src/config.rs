use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "beach-switchboard",
    author,
    version,
    about = "Beach call switchboard: relays offers, answers and candidates between endpoints"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the relay (default when no command is given).
    Serve,
    /// Connect to a running relay, register, and optionally place a test call.
    Probe(ProbeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "SWITCHBOARD_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Seconds an offer may stay unanswered before both sides are told. 0 disables.
    #[arg(long, env = "SWITCHBOARD_OFFER_TIMEOUT_SECS", default_value_t = 60)]
    pub offer_timeout_secs: u64,

    /// Seconds of silence after which an endpoint is unregistered.
    #[arg(long, env = "SWITCHBOARD_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// How often the reaper looks for stale offers and idle endpoints.
    #[arg(long, env = "SWITCHBOARD_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SWITCHBOARD_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Relay WebSocket URL.
    #[arg(short, long, default_value = "ws://127.0.0.1:8090/ws")]
    pub url: String,

    /// Identity to request instead of a relay-assigned one.
    #[arg(long)]
    pub id: Option<String>,

    /// Place a synthetic call to this endpoint.
    #[arg(long)]
    pub call: Option<String>,

    /// How long to wait for the relay (and the callee) before giving up.
    #[arg(long, default_value_t = 10)]
    pub wait_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// `None` when offers never expire.
    pub offer_timeout: Option<Duration>,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.sweep_interval_secs == 0 {
            bail!("sweep interval must be at least one second");
        }
        if args.idle_timeout_secs == 0 {
            bail!("idle timeout must be at least one second");
        }
        let offer_timeout =
            (args.offer_timeout_secs > 0).then(|| Duration::from_secs(args.offer_timeout_secs));
        Ok(RelayConfig {
            listen_addr,
            offer_timeout,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
