//! Applies edits and relays transient events within a live room.
//!
//! Text edits are last-writer-wins. Each room's write lock is the single
//! serialization point: apply and broadcast happen under it, so the order
//! of `textUpdate` frames on the room channel is the order edits were
//! applied. For persistent rooms the guard travels into the blocking store
//! write and comes back with its result; an edit that timed out keeps the
//! room locked until its write has finished, so it can never land after a
//! later edit.
//!
//! Transient events (typing, cursor) are best-effort and silently dropped
//! for non-members.

use serde_json::Value;
use std::sync::Arc;

use crate::broadcast::Audience;
use crate::error::{ForbiddenReason, SessionError};
use crate::protocol::{CursorUpdate, FileDeleted, FilesRelay, ServerEvent, TextUpdate, UserTyping};
use crate::registry::LiveRoom;
use crate::room::{now_millis, ConnectionId};
use crate::storage::{modify_room, StoreHandle};

/// File notifications forwarded between members.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Uploaded(Value),
    Deleted(String),
}

pub struct BroadcastCoordinator {
    store: StoreHandle,
}

impl BroadcastCoordinator {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Overwrite the room text and send `textUpdate` to every member,
    /// the editor included.
    ///
    /// `language: None` keeps the current language.
    pub async fn apply_text_change(
        &self,
        room: &Arc<LiveRoom>,
        conn: ConnectionId,
        text: String,
        language: Option<String>,
    ) -> Result<TextUpdate, SessionError> {
        let serial = room.lock_writes().await;
        let editor = room.member(conn).ok_or(SessionError::Unauthorized)?;
        let now = now_millis();

        let (text_content, language, _serial) = match room.ephemeral() {
            Some(eph) => {
                if !eph.policy.allow_edit {
                    return Err(SessionError::Forbidden(ForbiddenReason::EditDisabled));
                }
                let mut doc = eph.doc()?;
                doc.text = text;
                if let Some(language) = language {
                    doc.language = language;
                }
                (doc.text.clone(), doc.language.clone(), serial)
            }
            None => {
                let id = room.id().to_string();
                let (record, serial) = self
                    .store
                    .call(move |store| {
                        let (record, ()) = modify_room::<_, SessionError>(store, &id, |record| {
                            if record.is_expired_at(now) {
                                return Err(SessionError::Expired);
                            }
                            if !record.policy.allow_edit {
                                return Err(SessionError::Forbidden(ForbiddenReason::EditDisabled));
                            }
                            record.text.clone_from(&text);
                            if let Some(language) = &language {
                                record.language.clone_from(language);
                            }
                            record.counters.edits += 1;
                            Ok(())
                        })?;
                        Ok((record, serial))
                    })
                    .await?;
                (record.text, record.language, serial)
            }
        };

        let update = TextUpdate {
            text_content,
            language,
            editor: editor.display_name,
            editor_id: conn,
            timestamp: now,
        };
        room.broadcast()
            .send(Audience::Everyone, &ServerEvent::TextUpdate(update.clone()))?;
        log::debug!("Applied edit from {conn} to {} ({} bytes)", room.id(), update.text_content.len());
        Ok(update)
    }

    /// Returns whether the event was relayed.
    pub fn set_typing(&self, room: &LiveRoom, conn: ConnectionId, is_typing: bool) -> bool {
        let Some(member) = room.member(conn) else {
            return false;
        };
        let event = ServerEvent::UserTyping(UserTyping {
            connection_id: conn,
            display_name: member.display_name,
            is_typing,
        });
        room.broadcast().send(Audience::AllExcept(conn), &event).is_ok()
    }

    /// Returns whether the event was relayed.
    pub fn move_cursor(&self, room: &LiveRoom, conn: ConnectionId, position: Value) -> bool {
        let Some(member) = room.member(conn) else {
            return false;
        };
        log::trace!("Cursor update from {conn} in {}", room.id());
        let event = ServerEvent::CursorUpdate(CursorUpdate {
            connection_id: conn,
            display_name: member.display_name,
            position,
        });
        room.broadcast().send(Audience::AllExcept(conn), &event).is_ok()
    }

    /// Forward a file notification to the other members.
    pub fn relay_file_event(&self, room: &LiveRoom, conn: ConnectionId, event: FileEvent) -> Result<(), SessionError> {
        if room.member(conn).is_none() {
            return Err(SessionError::Unauthorized);
        }
        let event = match event {
            FileEvent::Uploaded(files) => ServerEvent::FilesUploaded(FilesRelay { files }),
            FileEvent::Deleted(file_id) => ServerEvent::FileDeleted(FileDeleted { file_id }),
        };
        room.broadcast().send(Audience::AllExcept(conn), &event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessGate, Credentials, SubnetPolicy};
    use crate::config::ServerConfig;
    use crate::registry::{Entered, SessionRegistry};
    use crate::room::fixtures::record;
    use crate::room::{Member, PUBLIC_GLOBAL};
    use crate::storage::fixtures::SlowStore;
    use crate::storage::{DataStore, DiskBlobStore, MemoryStore};
    use crate::broadcast::Envelope;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    struct Fixture {
        data: Arc<dyn DataStore>,
        registry: SessionRegistry,
        coordinator: BroadcastCoordinator,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), Duration::from_secs(2))
    }

    fn fixture_with(data: Arc<dyn DataStore>, timeout: Duration) -> Fixture {
        let store = StoreHandle::new(
            data.clone(),
            Arc::new(DiskBlobStore::new(std::env::temp_dir().join("shareflow_unused"))),
            timeout,
        );
        let gate = Arc::new(AccessGate::new(Box::new(SubnetPolicy::default())));
        Fixture {
            data,
            registry: SessionRegistry::new(store.clone(), gate, &ServerConfig::for_testing()),
            coordinator: BroadcastCoordinator::new(store),
        }
    }

    async fn join(f: &Fixture, id: &str, name: &str) -> Entered {
        let handle = f.registry.resolve(id).await.unwrap();
        let member = Member::new(Uuid::new_v4(), Some(name), None);
        f.registry.enter(handle, member, &Credentials::none(), None).await.unwrap()
    }

    /// Next event the server would actually deliver to `conn`.
    async fn next_for(rx: &mut broadcast::Receiver<Envelope>, conn: ConnectionId) -> (Audience, ServerEvent) {
        loop {
            let env = rx.recv().await.unwrap();
            if env.audience.includes(conn) {
                return (env.audience, ServerEvent::decode(&env.payload).unwrap());
            }
        }
    }

    #[tokio::test]
    async fn test_text_change_reaches_everyone_including_editor() {
        let f = fixture();
        f.data.insert_room(&record("0123456789abcdef")).unwrap();
        let mut a = join(&f, "0123456789abcdef", "a").await;
        let mut b = join(&f, "0123456789abcdef", "b").await;
        let (_, joined) = next_for(&mut a.events, a.member.connection_id).await;
        assert!(matches!(joined, ServerEvent::UserJoined(_)));

        f.coordinator
            .apply_text_change(&a.room, a.member.connection_id, "A".into(), Some("rust".into()))
            .await
            .unwrap();
        f.coordinator
            .apply_text_change(&b.room, b.member.connection_id, "B".into(), None)
            .await
            .unwrap();

        for (rx, conn) in [
            (&mut a.events, a.member.connection_id),
            (&mut b.events, b.member.connection_id),
        ] {
            let (audience, first) = next_for(rx, conn).await;
            let (_, second) = next_for(rx, conn).await;
            assert_eq!(audience, Audience::Everyone);
            let ServerEvent::TextUpdate(first) = first else { panic!("expected textUpdate") };
            let ServerEvent::TextUpdate(second) = second else { panic!("expected textUpdate") };
            assert_eq!(first.text_content, "A");
            assert_eq!(second.text_content, "B");
            assert_eq!(second.language, "rust");
            assert_eq!(second.editor, "b");
            assert_eq!(second.editor_id, b.member.connection_id);
        }

        let stored = f.data.get_room("0123456789abcdef").unwrap().unwrap();
        assert_eq!(stored.text, "B");
        assert_eq!(stored.counters.edits, 2);
    }

    #[tokio::test]
    async fn test_timed_out_edit_cannot_overwrite_later_edit() {
        let slow = SlowStore::new(Duration::from_millis(400)).on_update(|r| r.text == "A");
        let f = fixture_with(Arc::new(slow), Duration::from_millis(100));
        f.data.insert_room(&record("0123456789abcdef")).unwrap();
        let mut a = join(&f, "0123456789abcdef", "a").await;
        let b = join(&f, "0123456789abcdef", "b").await;

        let err = f
            .coordinator
            .apply_text_change(&a.room, a.member.connection_id, "A".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Timeout);

        // Queues behind the stalled write instead of racing it.
        f.coordinator
            .apply_text_change(&b.room, b.member.connection_id, "B".into(), None)
            .await
            .unwrap();

        let stored = f.data.get_room("0123456789abcdef").unwrap().unwrap();
        assert_eq!(stored.text, "B");
        assert_eq!(stored.counters.edits, 2);

        let (_, joined) = next_for(&mut a.events, a.member.connection_id).await;
        assert!(matches!(joined, ServerEvent::UserJoined(_)));
        let (_, update) = next_for(&mut a.events, a.member.connection_id).await;
        let ServerEvent::TextUpdate(update) = update else { panic!("expected textUpdate") };
        assert_eq!(update.text_content, "B");
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_member_edit_unauthorized() {
        let f = fixture();
        f.data.insert_room(&record("0123456789abcdef")).unwrap();
        let a = join(&f, "0123456789abcdef", "a").await;
        let err = f
            .coordinator
            .apply_text_change(&a.room, Uuid::new_v4(), "x".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Unauthorized);
    }

    #[tokio::test]
    async fn test_edit_disabled() {
        let f = fixture();
        let mut rec = record("0123456789abcdef");
        rec.policy.allow_edit = false;
        f.data.insert_room(&rec).unwrap();
        let a = join(&f, "0123456789abcdef", "a").await;
        let err = f
            .coordinator
            .apply_text_change(&a.room, a.member.connection_id, "x".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Forbidden(ForbiddenReason::EditDisabled));
    }

    #[tokio::test]
    async fn test_ephemeral_edit_keeps_language() {
        let f = fixture();
        let a = join(&f, PUBLIC_GLOBAL, "a").await;
        f.coordinator
            .apply_text_change(&a.room, a.member.connection_id, "one".into(), Some("python".into()))
            .await
            .unwrap();
        let update = f
            .coordinator
            .apply_text_change(&a.room, a.member.connection_id, "two".into(), None)
            .await
            .unwrap();
        assert_eq!(update.language, "python");
        assert_eq!(a.room.ephemeral().unwrap().doc().unwrap().text, "two");
    }

    #[tokio::test]
    async fn test_typing_excludes_sender() {
        let f = fixture();
        let a = join(&f, PUBLIC_GLOBAL, "a").await;
        let mut b = join(&f, PUBLIC_GLOBAL, "b").await;

        assert!(f.coordinator.set_typing(&a.room, a.member.connection_id, true));
        let (audience, event) = next_for(&mut b.events, b.member.connection_id).await;
        assert!(!audience.includes(a.member.connection_id));
        assert!(matches!(event, ServerEvent::UserTyping(UserTyping { is_typing: true, .. })));

        // Non-members are ignored.
        assert!(!f.coordinator.set_typing(&a.room, Uuid::new_v4(), true));
        assert!(!f.coordinator.move_cursor(&a.room, Uuid::new_v4(), json!({"line": 1})));
    }

    #[tokio::test]
    async fn test_file_relay_requires_membership() {
        let f = fixture();
        let a = join(&f, PUBLIC_GLOBAL, "a").await;
        assert!(f
            .coordinator
            .relay_file_event(&a.room, a.member.connection_id, FileEvent::Deleted("f1".into()))
            .is_ok());
        assert_eq!(
            f.coordinator
                .relay_file_event(&a.room, Uuid::new_v4(), FileEvent::Uploaded(json!([]))),
            Err(SessionError::Unauthorized)
        );
    }
}
