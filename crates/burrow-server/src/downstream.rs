//! Downstream traffic handler: the per-connection writer half.
//!
//! Drains the session's event queue and transforms each event into its wire
//! form. This is also where login notifications get their key bundles
//! attached, so vending happens as late as possible.

use std::borrow::Cow;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::SinkExt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use burrow_proto::{envelope, messages, Envelope};

use crate::error::ServerError;
use crate::event::SessionEvent;
use crate::listener::WsStream;
use crate::router::RoutingEngine;
use crate::session::RelaySession;

/// Write events to the socket until the queue closes or the transport dies.
pub async fn run(
    mut sink: SplitSink<WsStream, Message>,
    session: Arc<RelaySession>,
    router: Arc<RoutingEngine>,
) -> Result<(), ServerError> {
    let mut events = session
        .take_event_receiver()
        .ok_or_else(|| ServerError::Internal("event queue consumed twice".into()))?;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Close(reason) => {
                tracing::debug!(
                    user = %session.user_id,
                    code = reason.code(),
                    "closing connection"
                );
                let frame = CloseFrame {
                    code: CloseCode::from(reason.code()),
                    reason: Cow::Borrowed(reason.reason()),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
            event => {
                let Some(message) = event_envelope(event, &session, &router) else {
                    continue;
                };
                sink.send(Message::Text(envelope::serialize(&message)))
                    .await
                    .map_err(|e| ServerError::Transport(e.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Transform an event into the envelope the client sees.
///
/// A login whose peer vanished in the meantime produces nothing; the peer's
/// logout event is already behind it in the queue.
fn event_envelope(
    event: SessionEvent,
    session: &RelaySession,
    router: &RoutingEngine,
) -> Option<Envelope> {
    match event {
        SessionEvent::Message(message) => Some(message),
        SessionEvent::Login(peer) => match router.vend_bundle_for(&peer) {
            Some(bundle) => Some(messages::peer_login(&session.user_id, &peer, &bundle)),
            None => {
                tracing::debug!(peer = %peer, "suppressing login notification for vanished peer");
                None
            }
        },
        SessionEvent::Logout(peer) => Some(messages::peer_logout(&session.user_id, &peer)),
        SessionEvent::Replenish(count) => Some(messages::replenish_one_time_keys_req(
            &session.user_id,
            count,
        )),
        SessionEvent::Close(_) => None, // handled by the caller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SubscriptionStore;
    use burrow_proto::MsgId;
    use std::collections::HashSet;

    fn fixture() -> (RoutingEngine, RelaySession) {
        let router = RoutingEngine::new(SubscriptionStore::open_in_memory().unwrap());
        let session = RelaySession::new(
            "alice".into(),
            HashSet::new(),
            "idk-alice".into(),
            vec![],
        );
        (router, session)
    }

    #[test]
    fn message_events_pass_through() {
        let (router, session) = fixture();
        let original = messages::peer_logout("alice", "bob");

        let out = event_envelope(
            SessionEvent::Message(original.clone()),
            &session,
            &router,
        )
        .unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn login_event_attaches_a_vended_bundle() {
        let (router, session) = fixture();
        let bob = Arc::new(RelaySession::new(
            "bob".into(),
            HashSet::new(),
            "idk-bob".into(),
            vec!["otk-bob-0".into()],
        ));
        router.admit(&bob).unwrap();

        let out = event_envelope(SessionEvent::Login("bob".into()), &session, &router).unwrap();
        assert_eq!(out.header.msg_id, MsgId::PeerLogin);
        assert_eq!(out.header.receiver.as_deref(), Some("alice"));
        assert_eq!(out.header.sender, None);
        assert_eq!(out.payload_str("peer").unwrap(), "bob");
        let bundle: messages::KeyBundle =
            serde_json::from_value(out.payload_value("public_keys_bundle").unwrap().clone())
                .unwrap();
        assert_eq!(bundle.one_time_key.as_deref(), Some("otk-bob-0"));
    }

    #[test]
    fn login_event_for_vanished_peer_is_suppressed() {
        let (router, session) = fixture();
        assert!(event_envelope(SessionEvent::Login("ghost".into()), &session, &router).is_none());
    }

    #[test]
    fn replenish_event_is_relay_originated() {
        let (router, session) = fixture();
        let out =
            event_envelope(SessionEvent::Replenish(6), &session, &router).unwrap();
        assert_eq!(out.header.msg_id, MsgId::ReplenishOneTimeKeysReq);
        assert_eq!(out.header.sender, None);
        assert_eq!(out.payload_u64("count").unwrap(), 6);
    }
}
