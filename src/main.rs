//! echo-rate: TCP/UDP echo throughput meter
//!
//! Runs either side of an echo exchange:
//! - Server: echoes every byte (TCP) or datagram (UDP) back to its sender
//!   and logs the rate each peer is sending at
//! - Client: streams a fixed payload at the server, bounded by the bytes
//!   still in flight, and logs the rate the echo comes back at
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod error;
mod payload;
mod rate;
mod runtime;
mod server;

use config::{Config, Role};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role {
        Role::Server => info!(
            host = %config.host,
            port = config.port,
            transport = ?config.transport,
            max_connections = config.max_connections,
            "Starting echo server"
        ),
        Role::Client => info!(
            host = %config.host,
            port = config.port,
            transport = ?config.transport,
            runtime = ?config.runtime,
            sessions = config.sessions,
            max_inflight_bytes = config.max_inflight_bytes,
            "Starting echo client"
        ),
    }

    runtime::run(&config)?;
    Ok(())
}
