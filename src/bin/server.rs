//! Tunnel server
//!
//! Accepts tunnel connections, answers login requests and dials the
//! destinations of requested channels.

use anyhow::{Context, Result};
use clap::Parser;
use muxtunnel::config::{generate_example_config, Config};
use muxtunnel::{Server, ServerOptions};
use std::path::Path;
use tracing::{error, info};

/// Tunnel server - dials destinations for multiplexed channels
#[derive(Parser, Debug)]
#[command(name = "mux-server")]
#[command(about = "Tunnel server - dials destinations for multiplexed channels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port on all interfaces (overrides --listen)
    #[arg(short, long)]
    port: Option<u16>,

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

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt().with_env_filter(level).init();

    let listen_addr = match (args.port, args.listen) {
        (Some(port), _) => format!("0.0.0.0:{}", port),
        (None, Some(listen)) => listen,
        (None, None) => config.server.listen.clone(),
    };

    info!("muxtunnel server v{}", muxtunnel::VERSION);

    let server = Server::bind(&listen_addr, ServerOptions::from_config(&config))
        .await
        .context("Failed to bind to address")?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e).context("Accept loop failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
