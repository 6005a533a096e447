//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── SessionRegistry ── live rooms ── BroadcastGroup
//!             ├── handle_connection┤                                       │
//! Client B ──┘   (one task each)   ├── BroadcastCoordinator               │
//!                                  │                                       ▼
//!                                  └── StoreHandle ── DataStore      filtered by Audience
//!                                          │                               │
//!                                          └── BlobStore            ┌──────┼──────┐
//!                                                                   ▼      ▼      ▼
//! CleanupService (room + file sweeps) ── evicts live rooms      Client A  B      C
//! ```
//!
//! Each connection task owns one [`Session`] and selects over three
//! sources in priority order: frames from the socket, envelopes from the
//! current room's channel, and the room's closed signal. Envelopes are
//! filtered by [`Audience`] before being written out.
//!
//! [`Session`]: crate::engine::Session
//! [`Audience`]: crate::broadcast::Audience

use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as Handshake};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;

use crate::access::{AccessGate, SubnetPolicy};
use crate::broadcast::Envelope;
use crate::catalog::ShareCatalog;
use crate::cleanup::CleanupService;
use crate::config::ServerConfig;
use crate::engine::{Response, SessionEngine};
use crate::error::SessionError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::SessionRegistry;
use crate::storage::{DataStore, DiskBlobStore, MemoryStore, RocksStore, StoreConfig, StoreHandle};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub lagged_messages: u64,
}

pub struct SessionServer {
    config: ServerConfig,
    engine: Arc<SessionEngine>,
    catalog: Arc<ShareCatalog>,
    cleanup: Arc<CleanupService>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Sender<bool>,
}

impl SessionServer {
    /// Build the server and its stores. Opens RocksDB when `storage_path`
    /// is set, otherwise keeps everything in memory.
    pub fn new(config: ServerConfig) -> Result<Self, BoxError> {
        let data: Arc<dyn DataStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let blobs = Arc::new(DiskBlobStore::new(config.uploads_dir.clone()));
        let store = StoreHandle::new(data, blobs, config.store_timeout);

        let scope = SubnetPolicy::new(config.scope_allowlist.iter().copied());
        let gate = Arc::new(AccessGate::new(Box::new(scope)));
        let registry = Arc::new(SessionRegistry::new(store, gate, &config));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            engine: Arc::new(SessionEngine::new(Arc::clone(&registry))),
            catalog: Arc::new(
                ShareCatalog::new(Arc::clone(&registry), config.default_max_users)
                    .with_secret_cost(config.secret_cost),
            ),
            cleanup: Arc::new(CleanupService::new(registry)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown,
            config,
        })
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on `listener` and run the cleanup sweeps.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), BoxError> {
        let sweeper = Arc::clone(&self.cleanup).spawn(
            self.config.room_sweep_interval,
            self.config.file_sweep_interval,
            self.shutdown.subscribe(),
        );
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    log::info!("Session server shutting down");
                    break;
                }
            }
        }

        sweeper.await?;
        Ok(())
    }

    /// Stop accepting connections and stop the sweeps.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let trust_forwarded = self.config.trust_forwarded_headers;
        let mut origin = addr.ip();
        let callback = |req: &Request, resp: Handshake| -> Result<Handshake, ErrorResponse> {
            origin = origin_address(req.headers(), addr, trust_forwarded);
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr} (origin {origin})");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = self.engine.open_session(Some(origin));
        let conn = session.connection_id();
        let mut events: Option<broadcast::Receiver<Envelope>> = None;
        let mut closed: Option<watch::Receiver<bool>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    biased;

                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let reply = match ClientEvent::decode(text.as_str()) {
                                    Ok(event) => {
                                        let name = event.name();
                                        match self.engine.handle(&mut session, event).await {
                                            Ok(Response::None) => None,
                                            Ok(Response::Joined(sub)) => {
                                                events = Some(sub.events);
                                                closed = Some(sub.closed);
                                                Some(ServerEvent::ShareState(sub.state))
                                            }
                                            Err(e) => {
                                                log::debug!("{name} from {conn} rejected: {e}");
                                                Some(ServerEvent::error(&e))
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        self.stats.write().await.rejected_frames += 1;
                                        Some(ServerEvent::error(&SessionError::from(e)))
                                    }
                                };

                                // A failed join may have left the previous room.
                                if session.room_id().is_none() {
                                    events = None;
                                    closed = None;
                                }
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::text(reply.encode()?)).await?;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                self.stats.write().await.rejected_frames += 1;
                                let err = SessionError::BadRequest("binary frames are not supported".into());
                                ws_sender.send(Message::text(ServerEvent::error(&err).encode()?)).await?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    env = async {
                        match events.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match env {
                            Ok(env) => {
                                if env.audience.includes(conn) {
                                    ws_sender.send(Message::text(env.payload.to_string())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {conn} lagged by {n} messages");
                                self.stats.write().await.lagged_messages += n;
                                if let Some(room) = session.room() {
                                    room.broadcast().record_lag(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                events = None;
                            }
                        }
                    }

                    terminated = async {
                        match closed.as_mut() {
                            Some(rx) => rx.wait_for(|c| *c).await.is_ok(),
                            None => std::future::pending().await,
                        }
                    } => {
                        if terminated {
                            log::info!("Room of connection {conn} closed, disconnecting {addr}");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        closed = None;
                    }
                }
            }
            Ok(())
        }
        .await;

        self.engine.disconnect(&mut session).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    pub fn catalog(&self) -> &Arc<ShareCatalog> {
        &self.catalog
    }

    pub fn cleanup(&self) -> &Arc<CleanupService> {
        &self.cleanup
    }
}

/// Address a connection is admitted from.
///
/// `X-Real-IP` wins over the first `X-Forwarded-For` hop; both are ignored
/// unless the server sits behind a trusted proxy.
fn origin_address(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> IpAddr {
    if !trust_forwarded {
        return peer.ip();
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let real_ip = header("x-real-ip").and_then(|v| v.trim().parse().ok());
    let forwarded = || {
        header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
    };
    real_ip.or_else(forwarded).unwrap_or_else(|| peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewShare;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.9:5555".parse().unwrap()
    }

    #[test]
    fn test_origin_from_peer_by_default() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.7"));
        assert_eq!(origin_address(&headers, peer(), false), peer().ip());
    }

    #[test]
    fn test_origin_header_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.8, 10.1.1.1"));
        assert_eq!(origin_address(&headers, peer(), true), "192.168.1.8".parse::<IpAddr>().unwrap());

        headers.insert("x-real-ip", HeaderValue::from_static(" 192.168.1.7 "));
        assert_eq!(origin_address(&headers, peer(), true), "192.168.1.7".parse::<IpAddr>().unwrap());

        let mut garbage = HeaderMap::new();
        garbage.insert("x-real-ip", HeaderValue::from_static("not-an-ip"));
        assert_eq!(origin_address(&garbage, peer(), true), peer().ip());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SessionServer::new(ServerConfig::for_testing()).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_frames, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            uploads_dir: dir.path().join("uploads"),
            ..ServerConfig::for_testing()
        };
        let server = SessionServer::new(config).unwrap();
        let created = server.catalog().create(NewShare::default()).await.unwrap();
        assert!(server.engine().registry().resolve(&created.room_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = Arc::new(SessionServer::new(ServerConfig::for_testing()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(Arc::clone(&server).serve(listener));
        server.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
