//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::access::NetworkClass;
use crate::secret::{DEFAULT_COST, MIN_COST};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per live room
    pub broadcast_capacity: usize,
    /// `max_users` for shares created without an explicit policy
    pub default_max_users: usize,
    /// Capacity of the `public-global` room
    pub public_max_users: usize,
    /// Capacity of the `local-network` room
    pub local_max_users: usize,
    /// Upper bound on any single data store call
    pub store_timeout: Duration,
    /// How often expired rooms are swept
    pub room_sweep_interval: Duration,
    /// How often expired files are swept
    pub file_sweep_interval: Duration,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Directory holding uploaded file blobs
    pub uploads_dir: PathBuf,
    /// Take the origin address from `X-Real-IP` / `X-Forwarded-For`
    pub trust_forwarded_headers: bool,
    /// Network classes always accepted by scoped rooms
    pub scope_allowlist: Vec<NetworkClass>,
    /// bcrypt work factor for secrets of new private shares
    pub secret_cost: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            default_max_users: 10,
            public_max_users: 50,
            local_max_users: 20,
            store_timeout: Duration::from_secs(5),
            room_sweep_interval: Duration::from_secs(60 * 60),
            file_sweep_interval: Duration::from_secs(10 * 60),
            storage_path: None,
            uploads_dir: PathBuf::from("uploads"),
            trust_forwarded_headers: false,
            scope_allowlist: Vec::new(),
            secret_cost: DEFAULT_COST,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store, uploads under the system temp dir.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            store_timeout: Duration::from_secs(2),
            secret_cost: MIN_COST,
            uploads_dir: std::env::temp_dir().join(format!("shareflow_uploads_{}", uuid::Uuid::new_v4())),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.public_max_users, 50);
        assert_eq!(config.local_max_users, 20);
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.room_sweep_interval, Duration::from_secs(3600));
        assert!(config.storage_path.is_none());
        assert!(!config.trust_forwarded_headers);
        assert_eq!(config.secret_cost, 10);
    }

    #[test]
    fn test_for_testing_uses_ephemeral_port() {
        let config = ServerConfig::for_testing();
        assert!(config.bind_addr.ends_with(":0"));
        assert_ne!(config.uploads_dir, ServerConfig::for_testing().uploads_dir);
    }
}
