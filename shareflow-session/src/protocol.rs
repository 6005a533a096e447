//! JSON session protocol.
//!
//! Every frame is a WebSocket text message of the form
//! ```text
//! { "event": "<name>", "data": { ...camelCase fields... } }
//! ```
//! Client events are decoded into [`ClientEvent`]; everything the server
//! sends is a [`ServerEvent`]. Server events are encoded once per broadcast
//! and shared between receivers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::SessionError;
use crate::room::{ConnectionId, RoomId, RoomSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Malformed(msg) => SessionError::BadRequest(msg),
            ProtocolError::Serialization(msg) => SessionError::Internal(msg),
        }
    }
}

// ─── Client → server ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinShare {
    #[serde(alias = "shareId")]
    pub room_id: RoomId,
    #[serde(default, alias = "username", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextChange {
    #[serde(alias = "shareId")]
    pub room_id: RoomId,
    pub text_content: String,
    /// Absent keeps the room's current language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    #[serde(alias = "shareId")]
    pub room_id: RoomId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMove {
    #[serde(alias = "shareId")]
    pub room_id: RoomId,
    /// Opaque to the server.
    pub position: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesUploaded {
    #[serde(alias = "shareId")]
    pub room_id: RoomId,
    pub files: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDeleted {
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    JoinShare(JoinShare),
    TextChange(TextChange),
    Typing(Typing),
    CursorMove(CursorMove),
    FilesUploaded(FilesUploaded),
    FileDeleted(FileDeleted),
}

impl ClientEvent {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinShare(_) => "joinShare",
            Self::TextChange(_) => "textChange",
            Self::Typing(_) => "typing",
            Self::CursorMove(_) => "cursorMove",
            Self::FilesUploaded(_) => "filesUploaded",
            Self::FileDeleted(_) => "fileDeleted",
        }
    }
}

// ─── Server → client ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareState {
    pub text_content: String,
    pub language: String,
    pub title: String,
    pub active_users: usize,
}

impl From<RoomSnapshot> for ShareState {
    fn from(snap: RoomSnapshot) -> Self {
        Self {
            text_content: snap.text,
            language: snap.language,
            title: snap.title,
            active_users: snap.active_users,
        }
    }
}

/// Sent for both joins and leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub active_users: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextUpdate {
    pub text_content: String,
    pub language: String,
    /// Display name of the editor.
    pub editor: String,
    /// Connection id of the editor, so a client can spot its own echo.
    pub editor_id: ConnectionId,
    /// Unix milliseconds at which the edit was applied.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub position: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesRelay {
    pub files: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTerminated {
    pub room_id: RoomId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&SessionError> for ErrorPayload {
    fn from(err: &SessionError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    ShareState(ShareState),
    UserJoined(Presence),
    TextUpdate(TextUpdate),
    UserTyping(UserTyping),
    CursorUpdate(CursorUpdate),
    FilesUploaded(FilesRelay),
    FileDeleted(FileDeleted),
    UserLeft(Presence),
    SessionTerminated(SessionTerminated),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn error(err: &SessionError) -> Self {
        Self::Error(err.into())
    }
}
