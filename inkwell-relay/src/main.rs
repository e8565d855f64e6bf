//! Inkwell relay: standalone room server for collaborative canvases.
//!
//! Configured through `INKWELL_BIND_ADDR`, `INKWELL_MAX_PEERS` and
//! `INKWELL_BROADCAST_CAPACITY`; a bind address given as the first
//! argument wins over the environment. Log level follows `RUST_LOG`.

use std::process::ExitCode;
use std::time::Duration;

use inkwell_collab::server::{RelayServer, ServerConfig};
use log::{error, info};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let mut config = ServerConfig::from_env();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }
    info!(
        "Starting Inkwell relay on {} ({} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = RelayServer::new(config);
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;

    let serving = server.run();
    tokio::pin!(serving);
    loop {
        tokio::select! {
            result = &mut serving => {
                return match result {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        error!("Relay stopped: {e}");
                        ExitCode::FAILURE
                    }
                };
            }
            _ = ticker.tick() => {
                let stats = server.stats().await;
                info!(
                    "{} active connections in {} rooms, {} messages relayed, {} rejected",
                    stats.active_connections, stats.active_rooms, stats.total_messages, stats.rejected_messages
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return ExitCode::SUCCESS;
            }
        }
    }
}
