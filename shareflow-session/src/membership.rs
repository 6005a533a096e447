//! Ordered, duplicate-free member list of one room.
//!
//! `Membership` is plain data; callers hold the room's member lock while
//! they use it, which makes the capacity check and the insert a single
//! critical section.

use crate::error::{ForbiddenReason, SessionError};
use crate::room::{ConnectionId, Member};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The connection was already present; nothing changed.
    AlreadyMember,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: Vec<Member>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` unless the room is at `max_users`.
    ///
    /// Re-joining with the same connection id is a no-op and never counts
    /// against capacity.
    pub fn join(&mut self, member: Member, max_users: usize) -> Result<JoinOutcome, SessionError> {
        if self.contains(member.connection_id) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        if self.members.len() >= max_users {
            return Err(SessionError::Forbidden(ForbiddenReason::Capacity));
        }
        self.members.push(member);
        Ok(JoinOutcome::Joined)
    }

    pub fn leave(&mut self, conn: ConnectionId) -> Option<Member> {
        let pos = self.members.iter().position(|m| m.connection_id == conn)?;
        Some(self.members.remove(pos))
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| m.connection_id == conn)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.get(conn).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn member(name: &str) -> Member {
        Member::new(Uuid::new_v4(), Some(name), None)
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut m = Membership::new();
        let ada = member("ada");
        assert_eq!(m.join(ada.clone(), 5).unwrap(), JoinOutcome::Joined);
        assert_eq!(m.join(ada.clone(), 5).unwrap(), JoinOutcome::AlreadyMember);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let mut m = Membership::new();
        let a = member("a");
        m.join(a.clone(), 2).unwrap();
        m.join(member("b"), 2).unwrap();
        assert_eq!(
            m.join(member("c"), 2),
            Err(SessionError::Forbidden(ForbiddenReason::Capacity))
        );
        // An existing member re-joining a full room is fine.
        assert_eq!(m.join(a, 2).unwrap(), JoinOutcome::AlreadyMember);
    }

    #[test]
    fn test_leave_frees_one_slot() {
        let mut m = Membership::new();
        let a = member("a");
        m.join(a.clone(), 2).unwrap();
        m.join(member("b"), 2).unwrap();

        assert_eq!(m.leave(a.connection_id).map(|x| x.display_name), Some("a".into()));
        assert!(m.leave(a.connection_id).is_none());
        m.join(member("c"), 2).unwrap();
        assert!(m.join(member("d"), 2).is_err());
    }

    #[test]
    fn test_order_preserved() {
        let mut m = Membership::new();
        for name in ["x", "y", "z"] {
            m.join(member(name), 10).unwrap();
        }
        let names: Vec<_> = m.members().iter().map(|x| x.display_name.as_str()).collect();
        assert_eq!(names, ["x", "y", "z"]);
    }
}
