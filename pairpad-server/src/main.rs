//! pairpad hub daemon.
//!
//! Runs the collaboration hub on `PAIRPAD_BIND` (default `127.0.0.1:3001`).
//! Logging is configured through `RUST_LOG`.

use log::{error, info};
use pairpad_collab::server::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: std::env::var("PAIRPAD_BIND")
            .unwrap_or_else(|_| ServerConfig::default().bind_addr),
        ..ServerConfig::default()
    };

    info!("Starting pairpad hub on {}", config.bind_addr);
    let server = CollabServer::new(config);
    if let Err(e) = server.run().await {
        error!("Hub terminated: {e}");
        std::process::exit(1);
    }
}
