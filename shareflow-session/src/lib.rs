//! # shareflow-session — real-time session engine for shared text and files
//!
//! Clients join a share over WebSocket, receive its current state, and then
//! see each other's edits, presence and typing as they happen. Shares live
//! in a data store with an expiry; two well-known rooms exist only in memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   JSON frames    ┌───────────────┐
//! │ SessionClient │ ◄──────────────► │ SessionServer │
//! └───────────────┘  {event, data}   └───────┬───────┘
//!                                            │ SessionEngine (per connection)
//!                  ┌─────────────────────────┼─────────────────────────┐
//!                  ▼                         ▼                         ▼
//!          ┌───────────────┐        ┌─────────────────┐        ┌───────────────┐
//!          │ AccessGate    │◄───────│ SessionRegistry │───────►│ Broadcast     │
//!          │ secret, scope │        │ live rooms      │        │ Coordinator   │
//!          └───────────────┘        └────────┬────────┘        └───────────────┘
//!                                            │
//!          ┌───────────────┐        ┌────────┴────────┐
//!          │ ShareCatalog  │───────►│ StoreHandle     │◄────── CleanupService
//!          └───────────────┘        │ RocksDB / blobs │        (expiry sweeps)
//!                                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire events
//! - [`registry`] — room lookup and live room table
//! - [`access`] — expiry, secret, capacity and network scope checks
//! - [`membership`] — per-room member list
//! - [`coordinator`] — edits and transient event relay
//! - [`broadcast`] — per-room fan-out with audience filtering
//! - [`cleanup`] — expiry sweeps for rooms and files
//! - [`catalog`] — create/read/update/delete shares and attach files
//! - [`storage`] — data store trait, RocksDB and in-memory backends, blobs
//! - [`server`] / [`client`] — WebSocket endpoints

pub mod access;
pub mod broadcast;
pub mod catalog;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod membership;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod secret;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessGate, Credentials, NetworkClass, ScopePolicy, SubnetPolicy};
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
pub use catalog::{CreatedShare, ExpiryPreset, NewFile, NewShare, ShareCatalog, SharePatch, ShareView};
pub use cleanup::{CleanupService, SweepReport};
pub use client::{ClientError, SessionClient};
pub use config::ServerConfig;
pub use coordinator::BroadcastCoordinator;
pub use engine::{Session, SessionEngine};
pub use error::{ForbiddenReason, SessionError};
pub use protocol::{ClientEvent, ProtocolError, ServerEvent};
pub use registry::{LiveRoom, SessionRegistry};
pub use room::{FileRef, Member, RoomPolicy, RoomRecord, TrustMode, LOCAL_NETWORK, PUBLIC_GLOBAL};
pub use secret::SecretHash;
pub use server::{ServerStats, SessionServer};
pub use storage::{
    BlobStore, DataStore, DiskBlobStore, MemoryStore, RocksStore, StoreConfig, StoreError, StoreHandle,
};
