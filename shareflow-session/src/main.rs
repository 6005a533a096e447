//! shareflow-session server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use shareflow_session::access::NetworkClass;
use shareflow_session::{ServerConfig, SessionServer};

/// Real-time session server for shared text and files
#[derive(Parser, Debug)]
#[command(name = "shareflow-session")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090", env = "SHAREFLOW_BIND")]
    bind: String,

    /// RocksDB directory; omit to keep shares in memory
    #[arg(long, env = "SHAREFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory holding uploaded file blobs
    #[arg(long, default_value = "uploads", env = "SHAREFLOW_UPLOADS_DIR")]
    uploads_dir: PathBuf,

    /// Per-room broadcast buffer
    #[arg(long, default_value_t = 256, env = "SHAREFLOW_BROADCAST_CAPACITY")]
    broadcast_capacity: usize,

    /// Data store call timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "SHAREFLOW_STORE_TIMEOUT_MS")]
    store_timeout_ms: u64,

    /// Seconds between expired-room sweeps
    #[arg(long, default_value_t = 3600, env = "SHAREFLOW_ROOM_SWEEP_SECS")]
    room_sweep_secs: u64,

    /// Seconds between expired-file sweeps
    #[arg(long, default_value_t = 600, env = "SHAREFLOW_FILE_SWEEP_SECS")]
    file_sweep_secs: u64,

    /// Read the client address from X-Real-IP / X-Forwarded-For
    #[arg(long, env = "SHAREFLOW_TRUST_PROXY")]
    trust_proxy: bool,

    /// Networks always accepted by scoped rooms, e.g. 192.168.1.0/24
    #[arg(long = "scope-allow", value_delimiter = ',', env = "SHAREFLOW_SCOPE_ALLOW")]
    scope_allow: Vec<NetworkClass>,

    /// bcrypt work factor for secrets of new private shares
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(4..=31), env = "SHAREFLOW_SECRET_COST")]
    secret_cost: u32,

    /// Log level
    #[arg(long, default_value = "info", env = "SHAREFLOW_LOG_LEVEL")]
    log_level: LevelFilter,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            broadcast_capacity: self.broadcast_capacity,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            room_sweep_interval: Duration::from_secs(self.room_sweep_secs.max(1)),
            file_sweep_interval: Duration::from_secs(self.file_sweep_secs.max(1)),
            storage_path: self.data_dir,
            uploads_dir: self.uploads_dir,
            trust_forwarded_headers: self.trust_proxy,
            scope_allowlist: self.scope_allow,
            secret_cost: self.secret_cost,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    let config = args.into_config();
    log::info!("Starting shareflow-session on {}", config.bind_addr);
    match &config.storage_path {
        Some(path) => log::info!("Persisting shares in {}", path.display()),
        None => log::warn!("No data directory given, shares are kept in memory"),
    }

    let server = Arc::new(SessionServer::new(config)?);
    let mut runner = tokio::spawn(Arc::clone(&server).run());

    tokio::select! {
        finished = &mut runner => return finished?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            server.shutdown();
        }
    }
    runner.await?
}
