//! Room, member and file records.
//!
//! A room is either one of the two well-known ephemeral rooms, whose state
//! only lives in memory, or a persistent [`RoomRecord`] owned by the data
//! store. Timestamps are unix milliseconds throughout.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::secret::SecretHash;

pub type RoomId = String;
pub type ConnectionId = Uuid;

/// Well-known ephemeral room open to everyone.
pub const PUBLIC_GLOBAL: &str = "public-global";
/// Well-known ephemeral room restricted by network scope.
pub const LOCAL_NETWORK: &str = "local-network";

/// Display name used when a joiner does not supply one.
pub const DEFAULT_DISPLAY_NAME: &str = "Anonymous";
pub const DEFAULT_LANGUAGE: &str = "plaintext";

/// How long an uploaded file is kept unless its room goes first.
pub const DEFAULT_FILE_RETENTION_MS: u64 = 12 * 60 * 60 * 1000;

pub fn is_well_known(room_id: &str) -> bool {
    room_id == PUBLIC_GLOBAL || room_id == LOCAL_NETWORK
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    /// Anyone with the id may join.
    Public,
    /// Joiners must share a network class with the room.
    Scoped,
    /// Joiners must present the room secret.
    Private,
}

impl std::fmt::Display for TrustMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Scoped => write!(f, "scoped"),
            Self::Private => write!(f, "private"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPolicy {
    pub allow_edit: bool,
    pub allow_download: bool,
    pub max_users: usize,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            allow_edit: true,
            allow_download: true,
            max_users: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub views: u64,
    pub downloads: u64,
    pub edits: u64,
}

/// One live connection inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub joined_at: u64,
    pub origin: Option<IpAddr>,
}

impl Member {
    pub fn new(connection_id: ConnectionId, display_name: Option<&str>, origin: Option<IpAddr>) -> Self {
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DISPLAY_NAME)
            .to_string();
        Self {
            connection_id,
            display_name,
            joined_at: now_millis(),
            origin,
        }
    }
}

/// Persistent room as held by the data store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub mode: TrustMode,
    pub title: String,
    pub text: String,
    pub language: String,
    pub secret: Option<SecretHash>,
    pub created_at: u64,
    pub expires_at: u64,
    /// Attached file ids, in upload order.
    pub files: Vec<Uuid>,
    /// Mirror of the live membership.
    pub active_users: Vec<Member>,
    pub policy: RoomPolicy,
    pub counters: UsageCounters,
    /// Bumped by every successful conditional write.
    pub version: u64,
}

impl RoomRecord {
    /// Expiry is inclusive of the instant itself: a room with
    /// `expires_at == now` is still live.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Structural checks every stored record must pass.
    pub fn validate(&self) -> Result<(), String> {
        if is_well_known(&self.id) {
            return Err(format!("room id {} is reserved", self.id));
        }
        if self.id.is_empty() {
            return Err("room id must not be empty".into());
        }
        match (&self.mode, &self.secret) {
            (TrustMode::Private, None) => Err("private room requires a secret".into()),
            (_, Some(hash)) if !hash.is_well_formed() => Err("malformed secret hash".into()),
            _ => Ok(()),
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            text: self.text.clone(),
            language: self.language.clone(),
            title: self.title.clone(),
            active_users: self.active_users.len(),
        }
    }
}

/// What an admitted joiner gets to see. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub text: String,
    pub language: String,
    pub title: String,
    pub active_users: usize,
}

/// Metadata for a file attached to a persistent room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: Uuid,
    pub room_id: RoomId,
    pub original_name: String,
    /// Key of the blob inside the blob store.
    pub blob_key: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: u64,
    pub expires_at: u64,
}

impl FileRef {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }
}
