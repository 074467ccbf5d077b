//! Tunnel client
//!
//! Connects to the tunnel server, logs in, and serves a local SOCKS5 proxy
//! whose connections are carried as channels over the tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use muxtunnel::config::{generate_example_config, Config};
use muxtunnel::proxy::Socks5Server;
use muxtunnel::{Client, ClientOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Tunnel client - local SOCKS5 proxy over a multiplexed tunnel
#[derive(Parser, Debug)]
#[command(name = "mux-client")]
#[command(about = "Tunnel client - local SOCKS5 proxy over a multiplexed tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let text = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        println!("{}", text);
        return Ok(());
    }

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(level).init();

    if let Some(server) = args.server {
        config.client.server = server;
    }
    if let Some(socks5) = args.socks5 {
        config.client.socks5_listen = socks5;
    }

    info!("muxtunnel client v{}", muxtunnel::VERSION);
    info!("Server: {}", config.client.server);

    let client = Arc::new(Client::new(ClientOptions::from_config(&config)));
    client
        .connect()
        .await
        .context("Failed to connect to server")?;

    let reconnect_interval = Duration::from_secs(config.client.reconnect_interval.max(1));
    tokio::spawn(Arc::clone(&client).run_reconnect(reconnect_interval));

    let proxy = Socks5Server::bind(&config.client.socks5_listen)
        .await
        .context("Failed to start SOCKS5 proxy")?;

    tokio::select! {
        result = proxy.run(Arc::clone(&client)) => {
            if let Err(e) = result {
                error!("SOCKS5 proxy stopped: {}", e);
                return Err(e).context("SOCKS5 proxy failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    if let Some(conn) = client.connection() {
        conn.close();
    }

    Ok(())
}
