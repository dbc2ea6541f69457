//! Upstream traffic handler: the per-connection reader half.
//!
//! Enforces one hard invariant (the envelope's claimed sender must be the
//! authenticated session), then either routes the message toward its
//! receiver or acts on it in-relay. Any shape violation is fatal for the
//! connection.

use std::sync::Arc;

use futures::stream::SplitStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use burrow_proto::{envelope, Envelope, MsgId};

use crate::error::ServerError;
use crate::listener::WsStream;
use crate::router::RoutingEngine;
use crate::session::RelaySession;

/// Read frames until the socket closes or a fatal protocol violation.
pub async fn run(
    mut stream: SplitStream<WsStream>,
    session: Arc<RelaySession>,
    router: Arc<RoutingEngine>,
) -> Result<(), ServerError> {
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| ServerError::Transport(e.to_string()))?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(()),
            // Control frames are handled by the websocket layer.
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(burrow_proto::ProtoError::Malformed(format!(
                    "unexpected frame type: {other:?}"
                ))
                .into())
            }
        };

        let message = envelope::deserialize(&text)?;
        validate_sender(&message, &session)?;
        handle_message(message, &session, &router)?;
    }
    Ok(())
}

/// A sender mismatch is a spoofing attempt and closes the connection.
fn validate_sender(message: &Envelope, session: &RelaySession) -> Result<(), ServerError> {
    if message.header.sender.as_deref() == Some(session.user_id.as_str()) {
        return Ok(());
    }
    Err(ServerError::Spoofing {
        claimed: message.header.sender.clone(),
        actual: session.user_id.clone(),
    })
}

/// Dispatch a validated upstream message.
fn handle_message(
    message: Envelope,
    session: &Arc<RelaySession>,
    router: &RoutingEngine,
) -> Result<(), ServerError> {
    match message.header.msg_id {
        // Peer-to-peer traffic passes through untouched.
        MsgId::UserMessage
        | MsgId::PeerHello
        | MsgId::SessionEstablished
        | MsgId::AckMessageDelivered
        | MsgId::NackMessageNotDelivered
        | MsgId::ShareFriend => router.route(message),

        MsgId::AddFriend => {
            let friend = message.payload_str("friend")?.to_string();
            router.add_friend(session, &friend)?;
        }
        MsgId::RemoveFriend => {
            let friend = message.payload_str("friend")?.to_string();
            router.remove_friend(session, &friend)?;
        }
        MsgId::RequestLogoutNotif => {
            let peer = message.payload_str("peer")?.to_string();
            router.request_logout_notif(&session.user_id, &peer);
        }
        MsgId::ReplenishOneTimeKeysResp => {
            let keys: std::collections::BTreeMap<String, String> =
                serde_json::from_value(message.payload_value("keys")?.clone()).map_err(|_| {
                    burrow_proto::ProtoError::MissingField("keys".into())
                })?;
            tracing::debug!(user = %session.user_id, count = keys.len(), "one-time keys replenished");
            session.add_one_time_keys(keys.into_values());
        }
        MsgId::GetOneTimeKeyReq => {
            let peer = message.payload_str("peer")?.to_string();
            router.get_one_time_key(session, &peer);
        }
        MsgId::AddBlacklist => {
            let users = user_list(&message)?;
            tracing::debug!(user = %session.user_id, count = users.len(), "blacklist extended");
            session.blacklist.lock().extend(users);
        }
        MsgId::RemoveBlacklist => {
            let users = user_list(&message)?;
            let mut blacklist = session.blacklist.lock();
            for user in &users {
                blacklist.remove(user);
            }
        }
        other => {
            tracing::warn!(
                user = %session.user_id,
                msg_id = ?other,
                "unsupported upstream message id"
            );
        }
    }
    Ok(())
}

fn user_list(message: &Envelope) -> Result<Vec<String>, ServerError> {
    serde_json::from_value(message.payload_value("users")?.clone())
        .map_err(|_| burrow_proto::ProtoError::MissingField("users".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionEvent;
    use crate::store::SubscriptionStore;
    use burrow_proto::messages;
    use std::collections::HashSet;

    fn fixture() -> (Arc<RoutingEngine>, Arc<RelaySession>) {
        let router = Arc::new(RoutingEngine::new(
            SubscriptionStore::open_in_memory().unwrap(),
        ));
        let session = Arc::new(RelaySession::new(
            "alice".into(),
            HashSet::new(),
            "idk-alice".into(),
            vec!["otk-1".into()],
        ));
        (router, session)
    }

    #[test]
    fn sender_must_match_the_session() {
        let (_router, session) = fixture();

        let mut legit = messages::user_message("bob", "hi");
        legit.header.sender = Some("alice".into());
        assert!(validate_sender(&legit, &session).is_ok());

        let mut spoofed = messages::user_message("bob", "hi");
        spoofed.header.sender = Some("bob".into());
        let err = validate_sender(&spoofed, &session).unwrap_err();
        assert!(matches!(err, ServerError::Spoofing { .. }));
        assert_eq!(err.close_reason().code(), 3002);

        let mut anonymous = messages::user_message("bob", "hi");
        anonymous.header.sender = None;
        assert!(validate_sender(&anonymous, &session).is_err());
    }

    #[test]
    fn replenish_response_refills_the_pool() {
        let (router, session) = fixture();
        let keys: std::collections::BTreeMap<String, String> = (0..3)
            .map(|i| (format!("id-{i}"), format!("key-{i}")))
            .collect();
        let mut message = messages::replenish_one_time_keys_resp(&keys);
        message.header.sender = Some("alice".into());

        handle_message(message, &session, &router).unwrap();
        assert_eq!(session.remaining_keys(), 4);
    }

    #[test]
    fn blacklist_round_trip() {
        let (router, session) = fixture();

        let mut add = messages::add_blacklist(&["mallory".to_string()]);
        add.header.sender = Some("alice".into());
        handle_message(add, &session, &router).unwrap();
        assert!(session.blacklist.lock().contains("mallory"));

        let mut remove = messages::remove_blacklist(&["mallory".to_string()]);
        remove.header.sender = Some("alice".into());
        handle_message(remove, &session, &router).unwrap();
        assert!(session.blacklist.lock().is_empty());
    }

    #[test]
    fn missing_payload_field_is_fatal() {
        let (router, session) = fixture();
        let message = Envelope::new(MsgId::AddFriend, Some("alice".into()), None);

        let err = handle_message(message, &session, &router).unwrap_err();
        assert_eq!(err.close_reason().code(), 3002);
    }

    #[test]
    fn routable_ids_reach_the_router() {
        let (router, session) = fixture();
        let (bob, bob_rx) = {
            let bob = Arc::new(RelaySession::new(
                "bob".into(),
                HashSet::new(),
                "idk-bob".into(),
                vec![],
            ));
            let rx = bob.take_event_receiver().unwrap();
            (bob, rx)
        };
        router.admit(&bob).unwrap();
        let mut bob_rx = bob_rx;

        let mut message = messages::user_message("bob", "hi");
        message.header.sender = Some("alice".into());
        handle_message(message, &session, &router).unwrap();

        let event = bob_rx.try_recv().unwrap();
        assert!(matches!(event, SessionEvent::Message(_)));
    }
}
