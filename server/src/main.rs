use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use shared::BroadcastFormat;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with server settings; flags below override it
    #[arg(short = 'c', long, env = "FLAGGI_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to bind both sockets to
    #[arg(short = 'H', long, env = "FLAGGI_HOST")]
    host: Option<String>,

    /// Port for the reliable handshake channel
    #[arg(short = 't', long, env = "FLAGGI_TCP_PORT")]
    tcp_port: Option<u16>,

    /// Port for state updates and broadcasts
    #[arg(short = 'u', long, env = "FLAGGI_UDP_PORT")]
    udp_port: Option<u16>,

    /// Update loop period in milliseconds
    #[arg(long, env = "FLAGGI_TICK_INTERVAL_MS")]
    tick_interval_ms: Option<u64>,

    /// Minimum gap between accepted records per address, 0 to disable
    #[arg(long, env = "FLAGGI_RATE_LIMIT_MS")]
    rate_limit_ms: Option<u64>,

    /// Evict sessions silent for this long, 0 to disable
    #[arg(long, env = "FLAGGI_SESSION_TIMEOUT_MS")]
    session_timeout_ms: Option<u64>,

    /// Maximum concurrent reliable connections
    #[arg(long, env = "FLAGGI_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Send every broadcast to this port instead of the client's source port
    #[arg(long, env = "FLAGGI_RESPONSE_PORT")]
    response_port: Option<u16>,

    /// Snapshot format: positions or full
    #[arg(long, env = "FLAGGI_BROADCAST_FORMAT")]
    broadcast_format: Option<BroadcastFormat>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if let Some(port) = self.udp_port {
            config.udp_port = port;
        }
        if let Some(ms) = self.tick_interval_ms {
            config.tick_interval_ms = ms;
        }
        if let Some(ms) = self.rate_limit_ms {
            config.rate_limit_ms = ms;
        }
        if let Some(ms) = self.session_timeout_ms {
            config.session_timeout_ms = ms;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if self.response_port.is_some() {
            config.response_port = self.response_port;
        }
        if let Some(format) = self.broadcast_format {
            config.broadcast_format = format;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    info!("Starting server with {:?}", config);

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return Err(e.into());
        }
    };
    let handle = server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    handle.shutdown().await;

    Ok(())
}
