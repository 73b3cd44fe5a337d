//! Sandbox bridge - spawns per-exercise desktop sandboxes on Docker.
//!
//! Usage:
//!   sandbox-bridge serve [--port 3001] [--public-url http://host]

use clap::{Parser, Subcommand};
use sandbox_bridge::docker::DockerBackend;
use sandbox_bridge::{http_server, AppState, BridgeConfig, SandboxManager};
use std::net::{IpAddr, SocketAddr};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-bridge")]
#[command(about = "Disposable desktop sandboxes with an HTTP API and websocket terminal")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "3001")]
        port: u16,

        /// Address to bind
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Base URL browsers use to reach published sandbox ports
        #[arg(long, env = "PUBLIC_URL", default_value = sandbox_bridge::config::DEFAULT_PUBLIC_URL)]
        public_url: String,

        /// Image used when a spawn request names none
        #[arg(long, env = "SANDBOX_IMAGE", default_value = sandbox_bridge::config::DEFAULT_IMAGE)]
        image: String,

        /// How long a spawn waits for the desktop to answer
        #[arg(long, default_value = "15")]
        readiness_timeout_secs: u64,

        /// Interval for dropping sandboxes whose container is gone (0 disables)
        #[arg(long, default_value = "60")]
        reap_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            host,
            public_url,
            image,
            readiness_timeout_secs,
            reap_interval_secs,
        } => {
            let config = BridgeConfig {
                public_url,
                default_image: image,
                readiness_timeout: Duration::from_secs(readiness_timeout_secs),
                reap_interval: Duration::from_secs(reap_interval_secs),
                ..Default::default()
            };

            let backend = match DockerBackend::connect().await {
                Ok(backend) => backend,
                Err(e) => {
                    error!("Error: cannot reach Docker daemon: {}", e);
                    exit(1);
                }
            };

            info!(public_url = %config.public_url, image = %config.default_image, "Sandbox bridge configured");
            let state = AppState::new(SandboxManager::new(Arc::new(backend), config));

            if let Err(e) = http_server::run_server(SocketAddr::new(host, port), state).await {
                error!("Error: server failed: {}", e);
                exit(1);
            }
        }
    }
}
