//! Per-room fan-out channel.
//!
//! One tokio broadcast channel per live room. Each event is JSON-encoded
//! once and shared as `Arc<str>`; receivers drop envelopes whose
//! [`Audience`] excludes them, so "everyone but the sender" costs the same
//! as "everyone".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, ServerEvent};
use crate::room::ConnectionId;

/// Which members of a room should see an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    AllExcept(ConnectionId),
    Only(ConnectionId),
}

impl Audience {
    pub fn includes(&self, conn: ConnectionId) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::AllExcept(excluded) => *excluded != conn,
            Audience::Only(target) => *target == conn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    /// Pre-encoded frame.
    pub payload: Arc<str>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub subscribers: usize,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow receiver may fall behind before it
    /// starts losing envelopes.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Encode `event` once and hand it to every subscriber.
    ///
    /// Returns the number of subscribers it was queued for. Zero
    /// subscribers is not an error.
    pub fn send(&self, audience: Audience, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let payload: Arc<str> = event.encode()?.into();
        Ok(self.send_raw(Envelope { audience, payload }))
    }

    pub fn send_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `missed` envelopes.
    pub fn record_lag(&self, missed: u64) {
        self.messages_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileDeleted, ServerEvent};
    use uuid::Uuid;

    fn event() -> ServerEvent {
        ServerEvent::FileDeleted(FileDeleted { file_id: "f1".into() })
    }

    #[test]
    fn test_audience_filter() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(Audience::Everyone.includes(a));
        assert!(!Audience::AllExcept(a).includes(a));
        assert!(Audience::AllExcept(a).includes(b));
        assert!(Audience::Only(a).includes(a));
        assert!(!Audience::Only(a).includes(b));
    }

    #[tokio::test]
    async fn test_fan_out_shares_payload() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let count = group.send(Audience::Everyone, &event()).unwrap();
        assert_eq!(count, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&e1.payload, &e2.payload));
        assert!(e1.payload.contains("fileDeleted"));
    }

    #[test]
    fn test_send_without_subscribers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.send(Audience::Everyone, &event()).unwrap(), 0);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for _ in 0..5 {
            group.send(Audience::Everyone, &event()).unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_lagged, 3);
        assert_eq!(group.stats().subscribers, 1);
    }
}
