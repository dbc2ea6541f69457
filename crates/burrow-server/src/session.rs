use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::event::SessionEvent;

/// Depth of a session's event queue. A full queue means the consumer cannot
/// keep up; senders treat that the same as the peer being unavailable.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Per-connection state for one authenticated client.
///
/// Shared between the routing engine and the connection's two tasks; every
/// mutable part sits behind its own lock and no lock is held across an await.
pub struct RelaySession {
    /// The authenticated user id (public key digest).
    pub user_id: String,
    /// The client's long-lived ratchet identity key.
    pub identity_key: String,
    /// Presence interests declared at login plus runtime additions.
    pub subscriptions: Mutex<HashSet<String>>,
    /// FIFO pool of unconsumed one-time keys.
    one_time_keys: Mutex<VecDeque<String>>,
    /// One-shot logout watchers outside the subscription graph.
    pub one_time_watchers: Mutex<HashSet<String>>,
    /// Senders this client refuses traffic from.
    pub blacklist: Mutex<HashSet<String>>,
    event_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl RelaySession {
    pub fn new(
        user_id: String,
        subscriptions: HashSet<String>,
        identity_key: String,
        one_time_keys: Vec<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            user_id,
            identity_key,
            subscriptions: Mutex::new(subscriptions),
            one_time_keys: Mutex::new(one_time_keys.into()),
            one_time_watchers: Mutex::new(HashSet::new()),
            blacklist: Mutex::new(HashSet::new()),
            event_tx: Mutex::new(Some(event_tx)),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Pop the oldest one-time key, if any.
    pub fn pop_one_time_key(&self) -> Option<String> {
        self.one_time_keys.lock().pop_front()
    }

    /// Count of unconsumed one-time keys.
    pub fn remaining_keys(&self) -> usize {
        self.one_time_keys.lock().len()
    }

    /// Append replenished one-time keys.
    pub fn add_one_time_keys(&self, keys: impl IntoIterator<Item = String>) {
        self.one_time_keys.lock().extend(keys);
    }

    /// Enqueue an event for the downstream writer. Fails when the queue is
    /// full or the writer is gone; callers treat both as the session being
    /// unavailable.
    pub fn send_event(&self, event: SessionEvent) -> Result<(), ServerError> {
        let sender = self
            .event_tx
            .lock()
            .clone()
            .ok_or_else(|| ServerError::Transport("event queue closed".into()))?;
        sender
            .try_send(event)
            .map_err(|e| ServerError::Transport(format!("event queue: {e}")))
    }

    /// Hand the queue's consuming end to the downstream writer. Yields
    /// `None` on the second call.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.lock().take()
    }

    /// Stop accepting events. Once in-flight clones drain, the downstream
    /// writer's `recv` completes and the writer exits.
    pub fn close_event_queue(&self) {
        self.event_tx.lock().take();
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("user_id", &self.user_id)
            .field("remaining_keys", &self.remaining_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(keys: &[&str]) -> RelaySession {
        RelaySession::new(
            "alice".into(),
            HashSet::new(),
            "idk".into(),
            keys.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn one_time_keys_pop_in_fifo_order() {
        let session = session(&["k1", "k2"]);
        assert_eq!(session.remaining_keys(), 2);
        assert_eq!(session.pop_one_time_key().as_deref(), Some("k1"));
        session.add_one_time_keys(["k3".to_string()]);
        assert_eq!(session.pop_one_time_key().as_deref(), Some("k2"));
        assert_eq!(session.pop_one_time_key().as_deref(), Some("k3"));
        assert_eq!(session.pop_one_time_key(), None);
    }

    #[test]
    fn full_event_queue_refuses_instead_of_blocking() {
        let session = session(&[]);
        for _ in 0..EVENT_QUEUE_DEPTH {
            session.send_event(SessionEvent::Logout("bob".into())).unwrap();
        }
        assert!(session
            .send_event(SessionEvent::Logout("bob".into()))
            .is_err());
    }

    #[test]
    fn closed_queue_refuses_events() {
        let session = session(&[]);
        session.close_event_queue();
        assert!(session
            .send_event(SessionEvent::Logout("bob".into()))
            .is_err());
    }

    #[test]
    fn event_receiver_is_taken_once() {
        let session = session(&[]);
        assert!(session.take_event_receiver().is_some());
        assert!(session.take_event_receiver().is_none());
    }
}
