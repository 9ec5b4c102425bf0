use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outpost::config::{
    OutpostConfig, TunnelConfig, DEFAULT_DEVICE, DEFAULT_LOCAL_HOST, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_RELAY,
};
use outpost::multi::TunnelManager;
use outpost::TunnelClient;
use outpost_shared::protocol::Visibility;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "outpost")]
#[command(version)]
#[command(about = "Expose a local HTTP server through an Outpost relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging and payload previews
    #[arg(short, long, global = true, env = "OUTPOST_DEBUG")]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a single local HTTP server
    Http(HttpArgs),
    /// Start every tunnel defined in a configuration file
    Start {
        /// Path to outpost.yml (searched in . and ~ when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct HttpArgs {
    /// Local port to expose
    port: u16,

    /// Relay server URL
    #[arg(short, long, env = "OUTPOST_RELAY", default_value = DEFAULT_RELAY)]
    relay: String,

    /// Domain registered with the relay
    #[arg(long, env = "OUTPOST_DOMAIN")]
    domain: String,

    /// Domain secret
    #[arg(long, env = "OUTPOST_SECRET", hide_env_values = true)]
    secret: String,

    /// Device name under the domain
    #[arg(long, env = "OUTPOST_DEVICE", default_value = DEFAULT_DEVICE)]
    device: String,

    /// Only reachable for authorized visitors
    #[arg(long, env = "OUTPOST_PRIVATE")]
    private: bool,

    /// Local hostname to forward to
    #[arg(long, default_value = DEFAULT_LOCAL_HOST)]
    local_host: String,

    /// Heartbeat period in milliseconds (0 disables the heartbeat)
    #[arg(long, env = "OUTPOST_PING_INTERVAL_MS", default_value_t = DEFAULT_PING_INTERVAL_MS)]
    ping_interval_ms: u64,

    /// Delay before reconnecting in milliseconds (0 disables reconnecting)
    #[arg(long, env = "OUTPOST_RECONNECT_INTERVAL_MS", default_value_t = DEFAULT_RECONNECT_INTERVAL_MS)]
    reconnect_interval_ms: u64,

    /// Write request chunks that arrive mid-exchange straight to the local server
    #[arg(long)]
    stream: bool,
}

impl HttpArgs {
    fn into_config(self, debug: bool) -> TunnelConfig {
        TunnelConfig {
            relay: self.relay,
            domain: self.domain,
            secret: self.secret,
            device: self.device,
            visibility: if self.private { Visibility::Private } else { Visibility::Public },
            local_host: self.local_host,
            local_port: self.port,
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            stream_requests: self.stream,
            debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "outpost=debug" } else { "outpost=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Http(args) => run_http_tunnel(args.into_config(cli.debug)).await,
        Commands::Start { config } => run_from_config(config, cli.debug).await,
    }
}

/// Run a single tunnel until Ctrl+C
async fn run_http_tunnel(config: TunnelConfig) -> Result<()> {
    let tunnel = TunnelClient::start(config);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down...");
            tunnel.close();
            tunnel.closed().await;
        }
        _ = tunnel.closed() => {
            info!("Tunnel stopped");
        }
    }

    Ok(())
}

/// Run every tunnel of a configuration file until Ctrl+C
async fn run_from_config(path: Option<PathBuf>, debug: bool) -> Result<()> {
    let path = path
        .or_else(OutpostConfig::find_config)
        .context("No configuration file found (looked for outpost.yml in . and ~)")?;
    let mut config = OutpostConfig::load(&path)?;
    config.debug |= debug;

    let mut manager = TunnelManager::new(config);
    manager.start_all();
    manager.wait_for_shutdown().await
}
