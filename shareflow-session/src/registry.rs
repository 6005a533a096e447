//! Session registry: room lookup and the table of live rooms.
//!
//! ```text
//!   resolve(id) ──► well-known?  ──yes──► Arc<LiveRoom> (ephemeral, never dropped)
//!                      │
//!                      no
//!                      ▼
//!                 StoreHandle::call(get_room) ──► RoomRecord
//!
//!   enter(handle) ──► live table ──► LiveRoom { members, write_lock, broadcast, closed }
//! ```
//!
//! Lock order is live table, then a room's member lock. Both are plain
//! mutexes and are never held across an `.await`. A room's `write_lock` is
//! async and is handed into the blocking store call it guards, so it is
//! only released once that write has really finished, even after the
//! caller gave up with `Timeout`. A persistent room's live
//! entry is created on first join and dropped when its last member leaves.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch, OwnedMutexGuard};

use crate::access::{AccessGate, AdmissionTarget, Credentials};
use crate::broadcast::{Audience, BroadcastGroup, Envelope};
use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::membership::{JoinOutcome, Membership};
use crate::protocol::{Presence, ServerEvent, SessionTerminated};
use crate::room::{
    now_millis, ConnectionId, Member, RoomId, RoomPolicy, RoomRecord, RoomSnapshot, TrustMode,
    DEFAULT_LANGUAGE, LOCAL_NETWORK, PUBLIC_GLOBAL,
};
use crate::storage::{modify_room, StoreHandle};

/// In-memory document of a well-known room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralDoc {
    pub text: String,
    pub language: String,
}

pub struct EphemeralRoom {
    pub mode: TrustMode,
    pub title: String,
    pub policy: RoomPolicy,
    doc: Mutex<EphemeralDoc>,
}

impl EphemeralRoom {
    fn new(mode: TrustMode, title: &str, max_users: usize) -> Self {
        Self {
            mode,
            title: title.to_string(),
            policy: RoomPolicy {
                max_users,
                ..RoomPolicy::default()
            },
            doc: Mutex::new(EphemeralDoc {
                text: String::new(),
                language: DEFAULT_LANGUAGE.to_string(),
            }),
        }
    }

    pub fn doc(&self) -> Result<MutexGuard<'_, EphemeralDoc>, SessionError> {
        self.doc
            .lock()
            .map_err(|_| SessionError::Internal("room document lock poisoned".into()))
    }
}

/// A room with at least one connected member, or a well-known room.
pub struct LiveRoom {
    id: RoomId,
    ephemeral: Option<EphemeralRoom>,
    members: Mutex<Membership>,
    /// Serializes store writes and edit broadcasts for this room.
    write_lock: Arc<tokio::sync::Mutex<()>>,
    broadcast: BroadcastGroup,
    closed: watch::Sender<bool>,
}

impl LiveRoom {
    fn new(id: RoomId, ephemeral: Option<EphemeralRoom>, broadcast_capacity: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            ephemeral,
            members: Mutex::new(Membership::new()),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ephemeral(&self) -> Option<&EphemeralRoom> {
        self.ephemeral.as_ref()
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Wait for this room's write slot. The guard may be moved into a
    /// blocking store call.
    pub async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.write_lock).lock_owned().await
    }

    pub fn members(&self) -> Result<MutexGuard<'_, Membership>, SessionError> {
        self.members
            .lock()
            .map_err(|_| SessionError::Internal("membership lock poisoned".into()))
    }

    pub fn member(&self, conn: ConnectionId) -> Option<Member> {
        self.members().ok()?.get(conn).cloned()
    }

    pub fn member_count(&self) -> usize {
        self.members().map(|m| m.len()).unwrap_or(0)
    }

    pub fn member_list(&self) -> Vec<Member> {
        self.members().map(|m| m.members().to_vec()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn announce(&self, audience: Audience, event: &ServerEvent) {
        if let Err(e) = self.broadcast.send(audience, event) {
            log::warn!("Failed to encode event for room {}: {e}", self.id);
        }
    }
}

/// Result of [`SessionRegistry::resolve`].
#[derive(Clone)]
pub enum RoomHandle {
    Ephemeral(Arc<LiveRoom>),
    Persistent(RoomRecord),
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        match self {
            RoomHandle::Ephemeral(room) => room.id(),
            RoomHandle::Persistent(record) => &record.id,
        }
    }
}

/// What a successful join hands back to the connection.
pub struct Entered {
    pub room: Arc<LiveRoom>,
    pub member: Member,
    pub snapshot: RoomSnapshot,
    pub outcome: JoinOutcome,
    pub events: broadcast::Receiver<Envelope>,
    pub closed: watch::Receiver<bool>,
}

pub struct SessionRegistry {
    store: StoreHandle,
    gate: Arc<AccessGate>,
    well_known: HashMap<RoomId, Arc<LiveRoom>>,
    live: Arc<LiveTable>,
    broadcast_capacity: usize,
}

type LiveTable = Mutex<HashMap<RoomId, Arc<LiveRoom>>>;

fn lock_table(live: &LiveTable) -> Result<MutexGuard<'_, HashMap<RoomId, Arc<LiveRoom>>>, SessionError> {
    live.lock()
        .map_err(|_| SessionError::Internal("live room table poisoned".into()))
}

impl SessionRegistry {
    pub fn new(store: StoreHandle, gate: Arc<AccessGate>, config: &ServerConfig) -> Self {
        let mut well_known = HashMap::new();
        for (id, mode, title, max_users) in [
            (PUBLIC_GLOBAL, TrustMode::Public, "Public Global Share", config.public_max_users),
            (LOCAL_NETWORK, TrustMode::Scoped, "Local Network Share", config.local_max_users),
        ] {
            let room = LiveRoom::new(
                id.to_string(),
                Some(EphemeralRoom::new(mode, title, max_users)),
                config.broadcast_capacity,
            );
            well_known.insert(id.to_string(), Arc::new(room));
        }

        Self {
            store,
            gate,
            well_known,
            live: Arc::new(Mutex::new(HashMap::new())),
            broadcast_capacity: config.broadcast_capacity,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn gate(&self) -> &Arc<AccessGate> {
        &self.gate
    }

    fn live(&self) -> Result<MutexGuard<'_, HashMap<RoomId, Arc<LiveRoom>>>, SessionError> {
        lock_table(&self.live)
    }

    /// Find a room by id. Store lookups are bounded by the store timeout.
    pub async fn resolve(&self, room_id: &str) -> Result<RoomHandle, SessionError> {
        if let Some(room) = self.well_known.get(room_id) {
            return Ok(RoomHandle::Ephemeral(Arc::clone(room)));
        }
        let id = room_id.to_string();
        let record = self.store.call(move |store| Ok(store.get_room(&id)?)).await?;
        record.map(RoomHandle::Persistent).ok_or(SessionError::NotFound)
    }

    /// Live room for `room_id`, if anyone is connected (or it is well-known).
    pub fn live_room(&self, room_id: &str) -> Option<Arc<LiveRoom>> {
        if let Some(room) = self.well_known.get(room_id) {
            return Some(Arc::clone(room));
        }
        self.live().ok()?.get(room_id).cloned()
    }

    /// Forget the network class a scoped room was bootstrapped with; the
    /// next joiner claims it again. Current members stay.
    pub fn reset_scope(&self, room_id: &str) {
        self.gate.scope().reset(room_id);
    }

    /// Admit and record a member, subscribe it, and announce it.
    ///
    /// Admission and insertion share one critical section on the room's
    /// member lock. For persistent rooms the membership is then mirrored to
    /// the store; if that fails the join is rolled back.
    pub async fn enter(
        &self,
        handle: RoomHandle,
        member: Member,
        credentials: &Credentials,
        origin: Option<IpAddr>,
    ) -> Result<Entered, SessionError> {
        let now = now_millis();
        let conn = member.connection_id;

        match handle {
            RoomHandle::Ephemeral(room) => {
                let (outcome, snapshot, events, closed) = {
                    let eph = room
                        .ephemeral()
                        .ok_or_else(|| SessionError::Internal("well-known room without document".into()))?;
                    let target = AdmissionTarget {
                        room_id: room.id(),
                        mode: eph.mode,
                        secret: None,
                        expires_at: None,
                        max_users: eph.policy.max_users,
                    };
                    let mut members = room.members()?;
                    let claim = self.gate.admit(&target, origin, &members, conn, now)?;
                    let outcome = members.join(member.clone(), eph.policy.max_users)?;
                    self.gate.confirm(room.id(), claim);

                    let doc = eph.doc()?.clone();
                    let snapshot = RoomSnapshot {
                        text: doc.text,
                        language: doc.language,
                        title: eph.title.clone(),
                        active_users: members.len(),
                    };
                    let events = room.broadcast.subscribe();
                    if outcome == JoinOutcome::Joined {
                        room.announce(Audience::AllExcept(conn), &joined_event(&member, members.len()));
                    }
                    (outcome, snapshot, events, room.closed.subscribe())
                };
                log::info!("{} ({conn}) joined {}", member.display_name, room.id());
                Ok(Entered {
                    room,
                    member,
                    snapshot,
                    outcome,
                    events,
                    closed,
                })
            }

            RoomHandle::Persistent(record) => {
                self.check_record(&record, credentials, now).await?;

                let (room, outcome, events, closed) = {
                    let mut live = self.live()?;
                    let room = live
                        .entry(record.id.clone())
                        .or_insert_with(|| {
                            Arc::new(LiveRoom::new(record.id.clone(), None, self.broadcast_capacity))
                        })
                        .clone();
                    let mut members = room.members()?;
                    let target = AdmissionTarget::for_record(&record);
                    let claim = self.gate.admit(&target, origin, &members, conn, now)?;
                    let outcome = members.join(member.clone(), record.policy.max_users)?;
                    self.gate.confirm(&record.id, claim);
                    (Arc::clone(&room), outcome, room.broadcast.subscribe(), room.closed.subscribe())
                };

                let stored = match self.mirror_membership(&room, true).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        if outcome == JoinOutcome::Joined {
                            self.detach(&room, conn)?;
                            // A timed-out mirror may still land; this write
                            // queues behind it and stores the rolled-back list.
                            if let Err(mirror_err) = self.mirror_membership(&room, false).await {
                                log::warn!("Failed to roll back membership of {}: {mirror_err}", room.id());
                            }
                        }
                        return Err(e);
                    }
                };

                let snapshot = stored.snapshot();
                if outcome == JoinOutcome::Joined {
                    room.announce(Audience::AllExcept(conn), &joined_event(&member, room.member_count()));
                }
                log::info!("{} ({conn}) joined {}", member.display_name, room.id());
                Ok(Entered {
                    room,
                    member,
                    snapshot,
                    outcome,
                    events,
                    closed,
                })
            }
        }
    }

    /// Liveness and secret checks for a stored room. bcrypt runs on the
    /// blocking pool.
    async fn check_record(&self, record: &RoomRecord, credentials: &Credentials, now: u64) -> Result<(), SessionError> {
        if record.secret.is_none() || record.mode != TrustMode::Private {
            return self.gate.check_record(record, credentials, now);
        }
        let gate = Arc::clone(&self.gate);
        let (record, credentials) = (record.clone(), credentials.clone());
        tokio::task::spawn_blocking(move || gate.check_record(&record, &credentials, now))
            .await
            .map_err(|e| SessionError::Internal(format!("secret check failed: {e}")))?
    }

    /// Remove `conn` from `room` and tell the remaining members.
    ///
    /// Returns the removed member, or `None` if it was not a member (a
    /// second release is a no-op).
    pub async fn release(&self, room: &Arc<LiveRoom>, conn: ConnectionId) -> Result<Option<Member>, SessionError> {
        let Some((member, remaining)) = self.detach(room, conn)? else {
            return Ok(None);
        };
        room.announce(
            Audience::AllExcept(conn),
            &ServerEvent::UserLeft(Presence {
                connection_id: conn,
                display_name: member.display_name.clone(),
                active_users: remaining,
            }),
        );
        log::info!("{} ({conn}) left {}", member.display_name, room.id());

        if room.ephemeral().is_none() && !room.is_closed() {
            match self.mirror_membership(room, false).await {
                Ok(_) | Err(SessionError::NotFound) => {}
                Err(e) => log::warn!("Failed to record departure from {}: {e}", room.id()),
            }
        }
        Ok(Some(member))
    }

    /// Forcibly disconnect every member of a live room.
    ///
    /// Members are released one by one exactly as if they had disconnected,
    /// then everyone still subscribed gets `sessionTerminated` and the room
    /// is closed. Returns the number of members evicted.
    pub fn evict(&self, room_id: &str, reason: &str) -> Result<usize, SessionError> {
        let Some(room) = self.live()?.get(room_id).cloned() else {
            return Ok(0);
        };

        let mut evicted = 0;
        for member in room.member_list() {
            if let Some((member, remaining)) = self.detach(&room, member.connection_id)? {
                room.announce(
                    Audience::AllExcept(member.connection_id),
                    &ServerEvent::UserLeft(Presence {
                        connection_id: member.connection_id,
                        display_name: member.display_name,
                        active_users: remaining,
                    }),
                );
                evicted += 1;
            }
        }

        room.announce(
            Audience::Everyone,
            &ServerEvent::SessionTerminated(SessionTerminated {
                room_id: room_id.to_string(),
                reason: reason.to_string(),
            }),
        );
        room.closed.send_replace(true);
        self.live()?.remove(room_id);

        log::info!("Evicted {evicted} member(s) from {room_id}: {reason}");
        Ok(evicted)
    }

    /// Take `conn` out of the membership; drop the live entry if it was the
    /// last persistent member. Returns the member and the remaining count.
    fn detach(&self, room: &Arc<LiveRoom>, conn: ConnectionId) -> Result<Option<(Member, usize)>, SessionError> {
        if room.ephemeral().is_some() {
            let mut members = room.members()?;
            return Ok(members.leave(conn).map(|m| (m, members.len())));
        }

        let mut live = self.live()?;
        let mut members = room.members()?;
        let Some(member) = members.leave(conn) else {
            return Ok(None);
        };
        let remaining = members.len();
        if remaining == 0 && live.get(room.id()).is_some_and(|r| Arc::ptr_eq(r, room)) {
            live.remove(room.id());
            log::debug!("Live room {} dropped (empty)", room.id());
        }
        Ok(Some((member, remaining)))
    }

    /// Write the live membership into the stored record.
    ///
    /// The member list is taken from the live table inside the write
    /// closure, so whichever writer lands last stores the current
    /// membership. With `require_live` an expired room fails with `Expired`.
    async fn mirror_membership(&self, room: &Arc<LiveRoom>, require_live: bool) -> Result<RoomRecord, SessionError> {
        let live = Arc::clone(&self.live);
        let id = room.id().to_string();
        let serial = room.lock_writes().await;
        self.store
            .call(move |store| {
                let _serial = serial;
                let (record, ()) = modify_room::<_, SessionError>(store, &id, |record| {
                    if require_live && record.is_expired() {
                        return Err(SessionError::Expired);
                    }
                    let current = lock_table(&live)?.get(&id).cloned();
                    record.active_users = current.map(|room| room.member_list()).unwrap_or_default();
                    Ok(())
                })?;
                Ok(record)
            })
            .await
    }
}

fn joined_event(member: &Member, active_users: usize) -> ServerEvent {
    ServerEvent::UserJoined(Presence {
        connection_id: member.connection_id,
        display_name: member.display_name.clone(),
        active_users,
    })
}
