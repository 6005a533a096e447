//! Per-connection session handling on top of the registry and coordinator.
//!
//! A [`Session`] tracks the one room a connection is in. Joining another
//! room leaves the current one first. Errors are returned to the caller,
//! which reports them to the originating connection only.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::access::Credentials;
use crate::broadcast::Envelope;
use crate::coordinator::{BroadcastCoordinator, FileEvent};
use crate::error::SessionError;
use crate::protocol::{ClientEvent, JoinShare, ShareState};
use crate::registry::{LiveRoom, SessionRegistry};
use crate::room::{ConnectionId, Member};

/// State of one connection.
pub struct Session {
    connection_id: ConnectionId,
    origin: Option<IpAddr>,
    room: Option<Arc<LiveRoom>>,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn origin(&self) -> Option<IpAddr> {
        self.origin
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room.as_deref().map(LiveRoom::id)
    }

    pub fn room(&self) -> Option<&Arc<LiveRoom>> {
        self.room.as_ref()
    }

    /// The current room, if the session's `roomId` matches it.
    fn room_for(&self, room_id: &str) -> Option<&Arc<LiveRoom>> {
        self.room.as_ref().filter(|room| room.id() == room_id)
    }
}

/// Handed to the connection after a successful join.
pub struct Subscription {
    pub state: ShareState,
    pub events: broadcast::Receiver<Envelope>,
    pub closed: watch::Receiver<bool>,
}

pub enum Response {
    None,
    Joined(Subscription),
}

pub struct SessionEngine {
    registry: Arc<SessionRegistry>,
    coordinator: BroadcastCoordinator,
}

impl SessionEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let coordinator = BroadcastCoordinator::new(registry.store().clone());
        Self { registry, coordinator }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &BroadcastCoordinator {
        &self.coordinator
    }

    pub fn open_session(&self, origin: Option<IpAddr>) -> Session {
        Session {
            connection_id: uuid::Uuid::new_v4(),
            origin,
            room: None,
        }
    }

    pub async fn join(&self, session: &mut Session, request: JoinShare) -> Result<Subscription, SessionError> {
        let handle = self.registry.resolve(&request.room_id).await?;

        if let Some(current) = session.room.take() {
            if current.id() == request.room_id {
                session.room = Some(current);
            } else {
                self.registry.release(&current, session.connection_id).await?;
            }
        }

        let member = Member::new(session.connection_id, request.display_name.as_deref(), session.origin);
        let credentials = Credentials { secret: request.secret };
        let entered = self
            .registry
            .enter(handle, member, &credentials, session.origin)
            .await?;

        session.room = Some(entered.room);
        Ok(Subscription {
            state: entered.snapshot.into(),
            events: entered.events,
            closed: entered.closed,
        })
    }

    /// Handle one decoded client event.
    pub async fn handle(&self, session: &mut Session, event: ClientEvent) -> Result<Response, SessionError> {
        let conn = session.connection_id;
        match event {
            ClientEvent::JoinShare(request) => Ok(Response::Joined(self.join(session, request).await?)),

            ClientEvent::TextChange(change) => {
                let room = session.room_for(&change.room_id).ok_or(SessionError::Unauthorized)?;
                self.coordinator
                    .apply_text_change(room, conn, change.text_content, change.language)
                    .await?;
                Ok(Response::None)
            }

            ClientEvent::Typing(typing) => {
                if let Some(room) = session.room_for(&typing.room_id) {
                    self.coordinator.set_typing(room, conn, typing.is_typing);
                }
                Ok(Response::None)
            }

            ClientEvent::CursorMove(cursor) => {
                if let Some(room) = session.room_for(&cursor.room_id) {
                    self.coordinator.move_cursor(room, conn, cursor.position);
                }
                Ok(Response::None)
            }

            ClientEvent::FilesUploaded(upload) => {
                let room = session.room_for(&upload.room_id).ok_or(SessionError::Unauthorized)?;
                self.coordinator
                    .relay_file_event(room, conn, FileEvent::Uploaded(upload.files))?;
                Ok(Response::None)
            }

            ClientEvent::FileDeleted(deleted) => {
                let room = session.room.as_ref().ok_or(SessionError::Unauthorized)?;
                self.coordinator
                    .relay_file_event(room, conn, FileEvent::Deleted(deleted.file_id))?;
                Ok(Response::None)
            }
        }
    }

    /// Release the session's membership. Safe to call more than once.
    pub async fn disconnect(&self, session: &mut Session) {
        if let Some(room) = session.room.take() {
            if let Err(e) = self.registry.release(&room, session.connection_id).await {
                log::warn!("Failed to release {} from {}: {e}", session.connection_id, room.id());
            }
        }
    }
}
