//! Process configuration: CLI surface plus environment variables, resolved
//! once at startup into a single [`Config`] passed by `Arc` to every
//! component, instead of each module reading `std::env` on its own.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "relay-server", version, about = "Relay — remote observation of local AI coding agent sessions")]
pub struct Cli {
    /// Directory to watch for session transcripts.
    #[arg(long, env = "RELAY_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// HTTP/WS bind address.
    #[arg(long, env = "RELAY_BIND_ADDR", global = true)]
    pub bind: Option<SocketAddr>,

    /// Where server-local scratch state (logs) lives.
    #[arg(long, env = "RELAY_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server (default when no subcommand is given).
    Start,
    /// Print a one-shot enrollment QR to stdout without starting the server.
    Pair,
    /// Query `/health` on the locally configured bind address.
    Status,
}

/// Fully resolved runtime configuration, built once from [`Cli`] plus
/// environment variables and shared read-only across every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub bind_addr: SocketAddr,
    pub data_dir: Option<PathBuf>,
    pub enrollment_ttl: Duration,
    pub credential_ttl: Duration,
    pub auth_deadline: Duration,
    pub ping_interval: Duration,
    pub idle_cutoff: Duration,
    pub idle_threshold: Duration,
    pub poll_watcher: bool,
    pub public_base_url: String,
    pub history_buffer: usize,
}

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4000";

impl Config {
    pub fn resolve(cli: &Cli) -> anyhow::Result<Config> {
        let root = match &cli.root {
            Some(p) => p.clone(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?
                .join(".claude")
                .join("projects"),
        };

        let bind_addr = match cli.bind {
            Some(addr) => addr,
            None => DEFAULT_BIND_ADDR.parse()?,
        };

        let enrollment_ttl = Duration::from_secs(env_u64("RELAY_ENROLLMENT_TTL_SECS", 30)?);
        let credential_ttl = Duration::from_secs(env_u64("RELAY_CREDENTIAL_TTL_SECS", 2_592_000)?);
        let auth_deadline = Duration::from_secs(env_u64("RELAY_AUTH_DEADLINE_SECS", 30)?);
        let ping_interval = Duration::from_secs(env_u64("RELAY_PING_INTERVAL_SECS", 30)?);
        let idle_cutoff = Duration::from_secs(env_u64("RELAY_IDLE_CUTOFF_SECS", 60)?);
        let idle_threshold = Duration::from_secs(env_u64("RELAY_IDLE_THRESHOLD_SECS", 600)?);
        let poll_watcher = env_u64("RELAY_POLL_WATCHER", 0)? != 0;
        let history_buffer = env_u64("RELAY_HISTORY_BUFFER", 0)? as usize;

        let public_base_url = std::env::var("RELAY_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));

        Ok(Config {
            root,
            bind_addr,
            data_dir: cli.data_dir.clone(),
            enrollment_ttl,
            credential_ttl,
            auth_deadline,
            ping_interval,
            idle_cutoff,
            idle_threshold,
            poll_watcher,
            public_base_url,
            history_buffer,
        })
    }
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("invalid {name}={value:?}: {e}")),
        Err(_) => Ok(default),
    }
}
