//! Routing & presence engine.
//!
//! Single owner of the live session map. Routes envelopes between sessions,
//! fans out login/logout notifications, and vends one-time key bundles.
//! Everything here is synchronous: event delivery uses the sessions' bounded
//! queues, and a full queue is treated the same as the peer being offline.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use burrow_proto::messages::{self, KeyBundle};
use burrow_proto::Envelope;

use crate::error::ServerError;
use crate::event::SessionEvent;
use crate::session::RelaySession;
use crate::store::SubscriptionStore;

/// Target size of each user's one-time key pool.
pub const MAX_ONE_TIME_KEYS: usize = 10;
/// Pool level below which a replenishment request is sent.
pub const REPLENISH_THRESHOLD: usize = MAX_ONE_TIME_KEYS / 2;

pub struct RoutingEngine {
    sessions: RwLock<std::collections::HashMap<String, Arc<RelaySession>>>,
    store: SubscriptionStore,
}

impl RoutingEngine {
    pub fn new(store: SubscriptionStore) -> Self {
        Self {
            sessions: RwLock::new(std::collections::HashMap::new()),
            store,
        }
    }

    /// Look up a live session.
    pub fn session(&self, user_id: &str) -> Option<Arc<RelaySession>> {
        self.sessions.read().get(user_id).cloned()
    }

    /// Admit an authenticated session: register it, persist its subscription
    /// edges, notify its subscribers, and assemble the active-friends map
    /// (one vended bundle per live friend) for the caller to send back.
    pub fn admit(
        &self,
        session: &Arc<RelaySession>,
    ) -> Result<BTreeMap<String, KeyBundle>, ServerError> {
        let user_id = session.user_id.clone();
        let subscriptions: Vec<String> =
            session.subscriptions.lock().iter().cloned().collect();

        // Persist edges before registering: a store failure must not leave a
        // half-admitted session in the live map.
        for subscribed in &subscriptions {
            tracing::debug!(user = %user_id, peer = %subscribed, "persisting subscription");
            self.store.add_edge(&user_id, subscribed)?;
        }

        self.sessions
            .write()
            .insert(user_id.clone(), Arc::clone(session));
        tracing::info!(user = %user_id, "session admitted");

        // Tell everyone who subscribed to this user that they are online.
        for subscriber in self.live_sessions(&self.store.subscribers_of(&user_id)?) {
            if subscriber.user_id == user_id {
                continue;
            }
            if let Err(e) = subscriber.send_event(SessionEvent::Login(user_id.clone())) {
                tracing::warn!(
                    subscriber = %subscriber.user_id,
                    error = %e,
                    "failed to deliver login event"
                );
            }
        }

        // Assemble the newcomer's view of which friends are already online.
        let mut active_friends = BTreeMap::new();
        for friend in self.live_sessions(&subscriptions.iter().cloned().collect()) {
            let bundle = self.vend_bundle(&friend);
            active_friends.insert(friend.user_id.clone(), bundle);
        }
        Ok(active_friends)
    }

    /// Drop a session and fan out exactly one logout notification to every
    /// live subscriber and one-time watcher.
    pub fn disconnect(&self, user_id: &str) {
        let Some(session) = self.sessions.write().remove(user_id) else {
            return;
        };
        tracing::info!(user = %user_id, "session disconnected");

        let mut targets = self.store.subscribers_of(user_id).unwrap_or_else(|e| {
            tracing::error!(user = %user_id, error = %e, "failed to load subscribers");
            HashSet::new()
        });
        targets.extend(session.one_time_watchers.lock().iter().cloned());

        for watcher in self.live_sessions(&targets) {
            if let Err(e) = watcher.send_event(SessionEvent::Logout(user_id.to_string())) {
                tracing::warn!(
                    subscriber = %watcher.user_id,
                    error = %e,
                    "failed to deliver logout event"
                );
            }
        }
    }

    /// Route an envelope to its receiver's event queue. An unavailable
    /// receiver (offline, queue full, or blocking the sender) turns the
    /// message into a nack back at the sender; relay-originated messages
    /// that cannot be routed are dropped to keep nacks from recursing.
    pub fn route(&self, envelope: Envelope) {
        let mut current = envelope;
        loop {
            let sender = current.header.sender.clone();
            let receiver = current.header.receiver.clone();
            tracing::debug!(sender = ?sender, receiver = ?receiver, "routing message");

            let delivered = receiver
                .as_deref()
                .and_then(|r| self.session(r))
                .filter(|target| !blocks(target, sender.as_deref()))
                .is_some_and(|target| {
                    target
                        .send_event(SessionEvent::Message(current.clone()))
                        .is_ok()
                });
            if delivered {
                return;
            }

            let Some(sender) = sender else {
                tracing::warn!(
                    receiver = ?receiver,
                    msg_id = ?current.header.msg_id,
                    "dropped unroutable relay message"
                );
                return;
            };

            // Cookie may be absent: no payload validation happens here and
            // the message need not be a user message.
            let cookie = current.payload_str("cookie").unwrap_or("").to_string();
            tracing::debug!(
                sender = %sender,
                receiver = ?receiver,
                "receiver unavailable; nacking back to sender"
            );
            current = messages::nack_message_not_delivered(
                &sender,
                receiver.as_deref(),
                current.header.msg_id,
                &cookie,
                "Peer unavailable",
            );
        }
    }

    /// Vend a key bundle for a live peer, or `None` if they logged out in
    /// the meantime.
    pub fn vend_bundle_for(&self, peer: &str) -> Option<KeyBundle> {
        self.session(peer).map(|session| self.vend_bundle(&session))
    }

    /// Pop one one-time key from a session's pool, requesting replenishment
    /// when the pool runs low. An empty pool yields the `None` sentinel; the
    /// client reacts by requesting a fresh key later.
    fn vend_bundle(&self, session: &Arc<RelaySession>) -> KeyBundle {
        let one_time_key = session.pop_one_time_key();
        tracing::debug!(user = %session.user_id, "popping one-time key");
        if one_time_key.is_none() {
            tracing::warn!(user = %session.user_id, "one-time key pool exhausted");
        }

        let remaining = session.remaining_keys();
        if remaining < REPLENISH_THRESHOLD {
            tracing::debug!(
                user = %session.user_id,
                remaining,
                "requesting one-time key replenishment"
            );
            if let Err(e) =
                session.send_event(SessionEvent::Replenish(MAX_ONE_TIME_KEYS - remaining))
            {
                tracing::warn!(user = %session.user_id, error = %e, "failed to request replenishment");
            }
        }

        KeyBundle {
            identity_key: session.identity_key.clone(),
            one_time_key,
        }
    }

    /// Subscribe `session` to `friend` and, when the friend is already
    /// online, deliver the login notification right away so the client gets
    /// keys without reconnecting.
    pub fn add_friend(
        &self,
        session: &Arc<RelaySession>,
        friend: &str,
    ) -> Result<(), ServerError> {
        session.subscriptions.lock().insert(friend.to_string());
        self.store.add_edge(&session.user_id, friend)?;
        tracing::debug!(user = %session.user_id, friend = %friend, "subscription added");

        if self.session(friend).is_some() {
            if let Err(e) = session.send_event(SessionEvent::Login(friend.to_string())) {
                tracing::warn!(user = %session.user_id, error = %e, "failed to deliver login event");
            }
        }
        Ok(())
    }

    pub fn remove_friend(
        &self,
        session: &Arc<RelaySession>,
        friend: &str,
    ) -> Result<(), ServerError> {
        session.subscriptions.lock().remove(friend);
        self.store.remove_edge(&session.user_id, friend)?;
        tracing::debug!(user = %session.user_id, friend = %friend, "subscription removed");
        Ok(())
    }

    /// Register a one-shot logout watch on a live peer.
    pub fn request_logout_notif(&self, watcher: &str, peer: &str) {
        match self.session(peer) {
            Some(session) => {
                session.one_time_watchers.lock().insert(watcher.to_string());
                tracing::debug!(watcher = %watcher, peer = %peer, "logout watch registered");
            }
            None => {
                tracing::debug!(watcher = %watcher, peer = %peer, "logout watch on offline peer ignored");
            }
        }
    }

    /// Vend one of `peer`'s keys to `requester`, or nack when the peer is
    /// offline or out of keys.
    pub fn get_one_time_key(&self, requester: &Arc<RelaySession>, peer: &str) {
        let response = match self.session(peer) {
            Some(peer_session) => {
                let bundle = self.vend_bundle(&peer_session);
                if bundle.one_time_key.is_some() {
                    messages::get_one_time_key_resp(&requester.user_id, peer, &bundle)
                } else {
                    messages::nack_message_not_delivered(
                        &requester.user_id,
                        Some(peer),
                        burrow_proto::MsgId::GetOneTimeKeyReq,
                        "",
                        "One-time keys exhausted",
                    )
                }
            }
            None => messages::nack_message_not_delivered(
                &requester.user_id,
                Some(peer),
                burrow_proto::MsgId::GetOneTimeKeyReq,
                "",
                "Peer unavailable",
            ),
        };

        if let Err(e) = requester.send_event(SessionEvent::Message(response)) {
            tracing::warn!(user = %requester.user_id, error = %e, "failed to deliver key response");
        }
    }

    /// Snapshot the live sessions among `ids`, without holding the map lock
    /// while events are delivered.
    fn live_sessions(&self, ids: &HashSet<String>) -> Vec<Arc<RelaySession>> {
        let map = self.sessions.read();
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }
}

/// Whether the receiver refuses traffic from this sender. Relay-originated
/// messages are never blocked.
fn blocks(receiver: &RelaySession, sender: Option<&str>) -> bool {
    sender.is_some_and(|s| receiver.blacklist.lock().contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::MsgId;
    use tokio::sync::mpsc;

    fn engine() -> RoutingEngine {
        RoutingEngine::new(SubscriptionStore::open_in_memory().unwrap())
    }

    fn make_session(
        user_id: &str,
        subscriptions: &[&str],
        keys: usize,
    ) -> (Arc<RelaySession>, mpsc::Receiver<SessionEvent>) {
        let session = Arc::new(RelaySession::new(
            user_id.to_string(),
            subscriptions.iter().map(ToString::to_string).collect(),
            format!("idk-{user_id}"),
            (0..keys).map(|i| format!("otk-{user_id}-{i}")).collect(),
        ));
        let rx = session.take_event_receiver().unwrap();
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn sunny_day_admission_disturbs_no_one() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 10);

        let friends = engine.admit(&alice).unwrap();
        assert!(friends.is_empty());
        assert!(engine.session("alice").is_some());
    }

    #[test]
    fn login_notifies_live_subscribers_and_vends_bundles() {
        let engine = engine();
        let (alice, mut alice_rx) = make_session("alice", &[], 10);
        engine.admit(&alice).unwrap();

        // Bob subscribes to Alice; both should learn about each other.
        let (bob, _bob_rx) = make_session("bob", &["alice"], 10);
        let friends = engine.admit(&bob).unwrap();

        let bundle = friends.get("alice").unwrap();
        assert_eq!(bundle.identity_key, "idk-alice");
        assert_eq!(bundle.one_time_key.as_deref(), Some("otk-alice-0"));
        assert_eq!(alice.remaining_keys(), 9);

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::Login(peer) if peer == "bob"));
    }

    #[test]
    fn vended_keys_are_never_repeated() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 10);
        engine.admit(&alice).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let bundle = engine.vend_bundle_for("alice").unwrap();
            let key = bundle.one_time_key.unwrap();
            assert!(seen.insert(key), "a one-time key was vended twice");
        }
        assert!(engine.vend_bundle_for("alice").unwrap().one_time_key.is_none());
    }

    #[test]
    fn low_pool_triggers_replenish_event() {
        let engine = engine();
        let (alice, mut alice_rx) = make_session("alice", &[], REPLENISH_THRESHOLD + 1);
        engine.admit(&alice).unwrap();

        // First vend leaves the pool exactly at threshold.
        engine.vend_bundle_for("alice").unwrap();
        assert!(drain(&mut alice_rx).is_empty());

        // Second vend drops below it.
        engine.vend_bundle_for("alice").unwrap();
        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        let expected = MAX_ONE_TIME_KEYS - (REPLENISH_THRESHOLD - 1);
        assert!(
            matches!(&events[0], SessionEvent::Replenish(count) if *count == expected),
            "unexpected events: {events:?}"
        );
    }

    #[test]
    fn route_to_live_receiver_delivers_message_event() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 10);
        let (bob, mut bob_rx) = make_session("bob", &[], 10);
        engine.admit(&alice).unwrap();
        engine.admit(&bob).unwrap();

        let mut message = messages::user_message("bob", "hi");
        message.header.sender = Some("alice".into());
        engine.route(message);

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::Message(env) if env.header.msg_id == MsgId::UserMessage
        ));
    }

    #[test]
    fn route_to_offline_receiver_nacks_the_sender_with_cookie() {
        let engine = engine();
        let (alice, mut alice_rx) = make_session("alice", &[], 10);
        engine.admit(&alice).unwrap();

        let mut message = messages::user_message("bob", "hi");
        let cookie = message.payload_str("cookie").unwrap().to_string();
        message.header.sender = Some("alice".into());
        engine.route(message);

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        let SessionEvent::Message(nack) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(nack.header.msg_id, MsgId::NackMessageNotDelivered);
        assert_eq!(nack.header.sender, None);
        assert_eq!(nack.payload_str("extra").unwrap(), cookie);
        assert_eq!(nack.payload_str("reason").unwrap(), "Peer unavailable");
        assert_eq!(nack.payload_str("message_target").unwrap(), "bob");
    }

    #[test]
    fn unroutable_relay_message_is_dropped_not_recursed() {
        let engine = engine();
        // Nobody is online; a relay-originated nack to a dead receiver must
        // not loop.
        let nack = messages::nack_message_not_delivered(
            "ghost",
            Some("bob"),
            MsgId::UserMessage,
            "",
            "Peer unavailable",
        );
        engine.route(nack);
    }

    #[test]
    fn blacklisted_sender_gets_peer_unavailable() {
        let engine = engine();
        let (alice, mut alice_rx) = make_session("alice", &[], 10);
        let (bob, mut bob_rx) = make_session("bob", &[], 10);
        engine.admit(&alice).unwrap();
        engine.admit(&bob).unwrap();
        bob.blacklist.lock().insert("alice".to_string());

        let mut message = messages::user_message("bob", "hi");
        message.header.sender = Some("alice".into());
        engine.route(message);

        // Nothing reaches Bob; Alice sees the same nack as if Bob were
        // offline.
        assert!(drain(&mut bob_rx).is_empty());
        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        let SessionEvent::Message(nack) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(nack.payload_str("reason").unwrap(), "Peer unavailable");
    }

    #[test]
    fn disconnect_notifies_subscribers_and_watchers_once() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 10);
        let (bob, mut bob_rx) = make_session("bob", &["alice"], 10);
        let (carol, mut carol_rx) = make_session("carol", &[], 10);
        engine.admit(&alice).unwrap();
        engine.admit(&bob).unwrap();
        engine.admit(&carol).unwrap();

        // Carol is not subscribed but requested a one-shot logout watch.
        engine.request_logout_notif("carol", "alice");
        drain(&mut bob_rx);

        engine.disconnect("alice");
        assert!(engine.session("alice").is_none());

        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        assert!(matches!(&bob_events[0], SessionEvent::Logout(peer) if peer == "alice"));

        let carol_events = drain(&mut carol_rx);
        assert_eq!(carol_events.len(), 1);
        assert!(matches!(&carol_events[0], SessionEvent::Logout(peer) if peer == "alice"));
    }

    #[test]
    fn add_friend_with_live_peer_delivers_immediate_login() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 10);
        let (bob, mut bob_rx) = make_session("bob", &[], 10);
        engine.admit(&alice).unwrap();
        engine.admit(&bob).unwrap();

        engine.add_friend(&bob, "alice").unwrap();

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::Login(peer) if peer == "alice"));

        // The edge persisted: Alice's next login will notify Bob.
        assert!(engine
            .store
            .subscribers_of("alice")
            .unwrap()
            .contains("bob"));
    }

    #[test]
    fn get_one_time_key_nacks_when_pool_is_empty() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 0);
        let (bob, mut bob_rx) = make_session("bob", &[], 10);
        engine.admit(&alice).unwrap();
        engine.admit(&bob).unwrap();

        engine.get_one_time_key(&bob, "alice");

        let events = drain(&mut bob_rx);
        // A replenish-free nack: the empty pool also queued a Replenish to
        // Alice, not Bob.
        assert_eq!(events.len(), 1);
        let SessionEvent::Message(nack) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(nack.header.msg_id, MsgId::NackMessageNotDelivered);
        assert_eq!(nack.payload_str("reason").unwrap(), "One-time keys exhausted");
    }

    #[test]
    fn get_one_time_key_round_trips_when_available() {
        let engine = engine();
        let (alice, _alice_rx) = make_session("alice", &[], 10);
        let (bob, mut bob_rx) = make_session("bob", &[], 10);
        engine.admit(&alice).unwrap();
        engine.admit(&bob).unwrap();

        engine.get_one_time_key(&bob, "alice");

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        let SessionEvent::Message(resp) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(resp.header.msg_id, MsgId::GetOneTimeKeyResp);
        assert_eq!(resp.payload_str("peer").unwrap(), "alice");
    }
}
