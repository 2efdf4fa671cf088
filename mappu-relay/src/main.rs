//! mappu relay server.
//!
//! Multiplexes WebSocket clients into rooms and relays frames between them.
//! Rooms are in memory only and disappear after sitting empty past the TTL.
//!
//! ```bash
//! mappu-relay                      # 0.0.0.0:8080, 30 min TTL
//! PORT=9000 TTL_MIN=5 mappu-relay
//! mappu-relay --port 9000 --ttl-min 5 --verbose
//! ```

use std::time::Duration;

use clap::Parser;
use mappu_sync::{RelayServer, ServerConfig};

/// Flags override the `PORT` / `TTL_MIN` environment, which overrides the
/// built-in defaults.
#[derive(Parser)]
#[command(name = "mappu-relay")]
#[command(about = "Room relay for mappu-sync clients")]
#[command(version)]
struct Cli {
    /// Listen port [default: $PORT or 8080]
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen host [default: 0.0.0.0]
    #[arg(long)]
    host: Option<String>,

    /// Minutes an empty room is kept before eviction [default: $TTL_MIN or 30]
    #[arg(long)]
    ttl_min: Option<u64>,

    /// Seconds between eviction sweeps
    #[arg(long, default_value = "60")]
    sweep_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply the flags on top of `config`.
    fn server_config(&self, mut config: ServerConfig) -> ServerConfig {
        if self.port.is_some() || self.host.is_some() {
            let (host, port) = config.bind_addr.rsplit_once(':').unwrap_or(("0.0.0.0", "8080"));
            let host = self.host.as_deref().unwrap_or(host);
            let port = self.port.map_or_else(|| port.to_string(), |p| p.to_string());
            config.bind_addr = format!("{host}:{port}");
        }
        if let Some(minutes) = self.ttl_min {
            config.room_ttl = Duration::from_secs(minutes.saturating_mul(60));
        }
        config.sweep_interval = Duration::from_secs(self.sweep_secs.max(1));
        config
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = cli.server_config(ServerConfig::from_env());
    log::info!(
        "mappu-relay on {} (room TTL {} min, sweep every {}s)",
        config.bind_addr,
        config.room_ttl.as_secs() / 60,
        config.sweep_interval.as_secs()
    );
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down: {} connections served, {} frames relayed, {} rooms evicted",
                stats.total_connections,
                stats.frames_relayed,
                stats.rooms_evicted
            );
        }
    }
}
