//! Client session manager.
//!
//! Owns the relay connection: runs the Schnorr handshake, then multiplexes
//! the upstream writer (draining the user-facing queue) and the downstream
//! reader (dispatching inbound envelopes by message id) over a single task.
//! Keeping both halves on one task is also what serializes every ratchet
//! operation, which the crypto layer requires.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;

use burrow_crypto::{schnorr, Identity, RatchetAccount};
use burrow_proto::messages::{self, KeyBundle};
use burrow_proto::{envelope, Envelope, MsgId, ProtoError};

use crate::connector::{self, ConnectorConfig, WsStream};
use crate::error::ClientError;
use crate::interface::ClientHandle;
use crate::sessions::{SessionState, SessionsStateMachine};

/// Size of the one-time key pool uploaded during the relay handshake.
const INITIAL_ONE_TIME_KEYS: usize = 10;

/// Receiving ends of the downstream queues, handed to the UI layer.
pub struct SessionQueues {
    /// Decrypted user messages.
    pub user: mpsc::UnboundedReceiver<Envelope>,
    /// Control events: presence, delivery state, shared friends.
    pub system: mpsc::UnboundedReceiver<Envelope>,
}

pub struct SessionManager {
    identity: Identity,
    sessions: SessionsStateMachine,
    upstream_tx: mpsc::UnboundedSender<Envelope>,
    /// Taken by the run loop for the duration of a connection.
    upstream_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    user_tx: mpsc::UnboundedSender<Envelope>,
    system_tx: mpsc::UnboundedSender<Envelope>,
    shutdown: Arc<Notify>,
}

impl SessionManager {
    pub fn new(identity: Identity, account: RatchetAccount) -> (Self, ClientHandle, SessionQueues) {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (system_tx, system_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        let handle = ClientHandle {
            upstream: upstream_tx.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let queues = SessionQueues {
            user: user_rx,
            system: system_rx,
        };
        let manager = Self {
            identity,
            sessions: SessionsStateMachine::new(account),
            upstream_tx,
            upstream_rx: Some(upstream_rx),
            user_tx,
            system_tx,
            shutdown,
        };
        (manager, handle, queues)
    }

    /// Our own routing id.
    pub fn user_id(&self) -> &str {
        self.identity.user_id()
    }

    /// Build a user message and return it with its delivery cookie.
    pub fn user_message_to(peer: &str, text: &str) -> (Envelope, String) {
        let env = messages::user_message(peer, text);
        let cookie = env
            .payload_str("cookie")
            .map(str::to_string)
            .unwrap_or_default();
        (env, cookie)
    }

    /// Connect to the relay, run the identification handshake and serve the
    /// message pipeline until shutdown or disconnect.
    pub async fn connect(
        &mut self,
        config: &ConnectorConfig,
        friends: &[String],
    ) -> Result<(), ClientError> {
        let mut ws = connector::connect(config).await?;

        tracing::debug!("connected; running relay handshake");
        self.run_relay_handshake(&mut ws, friends).await?;
        tracing::debug!("handshake complete; serving upstream and downstream");

        let mut upstream_rx = self
            .upstream_rx
            .take()
            .ok_or_else(|| ClientError::Session("session manager already running".into()))?;

        let result = self.run_pipeline(&mut upstream_rx, ws).await;
        self.upstream_rx = Some(upstream_rx);
        result
    }

    /// The single socket-owner loop: writer and reader halves multiplexed.
    async fn run_pipeline(
        &mut self,
        upstream_rx: &mut mpsc::UnboundedReceiver<Envelope>,
        ws: WsStream,
    ) -> Result<(), ClientError> {
        let shutdown = Arc::clone(&self.shutdown);
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                () = shutdown.notified() => {
                    tracing::info!("shutdown requested; closing connection");
                    let _ = sink.close().await;
                    return Ok(());
                }
                maybe_out = upstream_rx.recv() => {
                    let Some(message) = maybe_out else { return Ok(()) };
                    self.handle_outgoing(&mut sink, message).await?;
                }
                maybe_in = stream.next() => {
                    match maybe_in {
                        Some(Ok(Message::Text(text))) => self.handle_incoming(&text),
                        Some(Ok(Message::Close(frame))) => {
                            let detail = frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "no close frame".into());
                            tracing::info!(detail = %detail, "relay closed the connection");
                            return Err(ClientError::Transport(format!(
                                "relay closed the connection: {detail}"
                            )));
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
                        None => return Err(ClientError::Transport("connection lost".into())),
                    }
                }
            }
        }
    }

    /// Prove key possession to the relay and learn who is online.
    async fn run_relay_handshake(
        &mut self,
        ws: &mut WsStream,
        friends: &[String],
    ) -> Result<(), ClientError> {
        let commit = schnorr::commitment()?;
        send_frame(
            ws,
            &messages::schnorr_commit(self.identity.public_pem(), &commit.commitment_pem),
        )
        .await?;

        let challenge_env = recv_frame(ws).await?;
        if challenge_env.header.msg_id != MsgId::SchnorrChallenge {
            return Err(ClientError::Handshake(format!(
                "expected a Schnorr challenge, got {:?}",
                challenge_env.header.msg_id
            )));
        }
        let challenge = schnorr::scalar_from_hex(challenge_env.payload_str("challenge")?)?;

        let response = schnorr::response(
            &self.identity.private_scalar(),
            &commit.secret,
            &challenge,
        );
        let one_time_keys = self.sessions.publish_one_time_keys(INITIAL_ONE_TIME_KEYS);
        send_frame(
            ws,
            &messages::schnorr_response(
                &schnorr::scalar_to_hex(&response),
                friends,
                self.sessions.identity_key(),
                &one_time_keys,
            ),
        )
        .await?;

        let active_friends = recv_frame(ws).await?;
        if active_friends.header.msg_id != MsgId::ActiveFriends {
            return Err(ClientError::Handshake(format!(
                "expected the active friends list, got {:?}",
                active_friends.header.msg_id
            )));
        }
        self.handle_active_friends(active_friends)
    }

    // ── Upstream ──────────────────────────────────────────────────────────

    async fn handle_outgoing<S>(&mut self, sink: &mut S, mut message: Envelope) -> Result<(), ClientError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        message.header.sender = Some(self.identity.user_id().to_string());

        let Some(receiver) = message.header.receiver.clone() else {
            // Relay-terminated message; no crypto session involved.
            return send_frame(sink, &message).await;
        };

        // Delivery signaling stays plaintext and bypasses session state:
        // a nack must still go out after the session it refers to is gone.
        if matches!(
            message.header.msg_id,
            MsgId::AckMessageDelivered | MsgId::NackMessageNotDelivered
        ) {
            let is_nack = message.header.msg_id == MsgId::NackMessageNotDelivered;
            send_frame(sink, &message).await?;
            if is_nack {
                // Reset is deliberately ordered after the write so the nack
                // does not race the teardown of its own session.
                self.reset_peer_session(&receiver);
            }
            return Ok(());
        }

        match self.sessions.state_of(&receiver) {
            Some(SessionState::Potential) => {
                tracing::debug!(
                    peer = %receiver,
                    "first message to peer; buffering and sending hello"
                );
                self.sessions.make_pending(&receiver, message)?;
                let mut hello = messages::peer_hello(&receiver);
                hello.header.sender = Some(self.identity.user_id().to_string());
                match self.encrypt_message_payload(hello) {
                    Ok(hello) => send_frame(sink, &hello).await?,
                    Err(e) => {
                        tracing::error!(peer = %receiver, error = %e, "hello encryption failed");
                        self.reset_peer_session(&receiver);
                    }
                }
            }
            Some(SessionState::Pending) => {
                tracing::warn!(
                    peer = %receiver,
                    "session not yet established; buffering message"
                );
                self.sessions.buffer_message(&receiver, message)?;
            }
            Some(SessionState::Active) => match self.encrypt_message_payload(message) {
                Ok(sealed) => send_frame(sink, &sealed).await?,
                Err(e) => {
                    tracing::error!(peer = %receiver, error = %e, "payload encryption failed");
                    self.reset_peer_session(&receiver);
                }
            },
            None => {
                tracing::warn!(
                    peer = %receiver,
                    msg_id = ?message.header.msg_id,
                    "no session with peer; dropping message"
                );
            }
        }
        Ok(())
    }

    /// Encrypt the payload fields designated for this message id.
    fn encrypt_message_payload(&mut self, mut message: Envelope) -> Result<Envelope, ClientError> {
        let receiver = message.header.receiver.clone().ok_or_else(|| {
            ClientError::Session("attempted payload encryption of a relay-terminated message".into())
        })?;

        match message.header.msg_id {
            MsgId::UserMessage => {
                let text = message.payload_str("text")?.to_string();
                let sealed = self.sessions.encrypt_for(&receiver, &text)?;
                message.set_payload("text", json!(sealed));
            }
            MsgId::PeerHello | MsgId::SessionEstablished => {
                let magic = message.payload_str("magic")?.to_string();
                let sealed = self.sessions.encrypt_for(&receiver, &magic)?;
                message.set_payload("magic", json!(sealed));
            }
            MsgId::ShareFriend => {
                // The local display name is personal information.
                let name = message.payload_str("name")?.to_string();
                let sealed = self.sessions.encrypt_for(&receiver, &name)?;
                message.set_payload("name", json!(sealed));
            }
            other => {
                tracing::error!(msg_id = ?other, "attempted encryption of unsupported message");
            }
        }
        Ok(message)
    }

    // ── Downstream ────────────────────────────────────────────────────────

    /// Dispatch one inbound frame. Never escalates: malformed inbound
    /// traffic is logged, session errors go through the nack-and-reset flow.
    fn handle_incoming(&mut self, text: &str) {
        let message = match envelope::deserialize(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed inbound frame");
                return;
            }
        };

        let result = match message.header.msg_id {
            MsgId::UserMessage => self.handle_user_message(message.clone()),
            MsgId::PeerHello => self.handle_peer_hello(&message),
            MsgId::SessionEstablished => self.handle_session_established(&message),
            MsgId::PeerLogin => self.handle_peer_login(message.clone()),
            MsgId::PeerLogout => self.handle_peer_logout(message.clone()),
            MsgId::ShareFriend => self.handle_share_friend(message.clone()),
            MsgId::AckMessageDelivered => self.handle_ack(message.clone()),
            MsgId::NackMessageNotDelivered => self.handle_nack(message.clone()),
            MsgId::ReplenishOneTimeKeysReq => self.handle_replenish_req(&message),
            MsgId::GetOneTimeKeyResp => self.handle_get_one_time_key_resp(&message),
            MsgId::ActiveFriends => self.handle_active_friends(message.clone()),
            other => {
                tracing::warn!(msg_id = ?other, "received unexpected message id");
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_session_error() {
                tracing::error!(
                    sender = ?message.header.sender,
                    error = %e,
                    "session error on inbound message"
                );
                self.handle_session_error(&message);
            } else {
                // Malformed payloads should never make it past the relay's
                // router; treat as peer-side malfunction.
                tracing::error!(
                    sender = ?message.header.sender,
                    error = %e,
                    "failed to handle inbound message"
                );
            }
        }
    }

    /// Translate a session error into a wire-visible nack. The reset itself
    /// runs in the upstream path after the nack has been written.
    fn handle_session_error(&mut self, message: &Envelope) {
        let Some(sender) = message.header.sender.clone() else {
            return;
        };

        match message.header.msg_id {
            MsgId::UserMessage => {
                let cookie = message
                    .payload_str("cookie")
                    .map(str::to_string)
                    .unwrap_or_default();
                self.queue_upstream(messages::nack_message_not_delivered(
                    &sender,
                    Some(self.identity.user_id()),
                    message.header.msg_id,
                    &cookie,
                    "Crypto session exception",
                ));
            }
            MsgId::PeerHello => {
                self.queue_upstream(messages::nack_message_not_delivered(
                    &sender,
                    Some(self.identity.user_id()),
                    message.header.msg_id,
                    "",
                    "Peer-to-peer handshake error",
                ));
            }
            other => {
                tracing::error!(
                    msg_id = ?other,
                    "session error handler called for an unexpected message"
                );
            }
        }
    }

    fn handle_user_message(&mut self, mut message: Envelope) -> Result<(), ClientError> {
        let sender = header_sender(&message)?;

        if self.sessions.state_of(&sender) != Some(SessionState::Active) {
            tracing::warn!(peer = %sender, "dropping user message: no active session");
            return Ok(());
        }

        let sealed = message.payload_str("text")?.to_string();
        let text = self.sessions.decrypt_from(&sender, &sealed)?;
        message.set_payload("text", json!(text));

        let cookie = message.payload_str("cookie")?.to_string();
        self.queue_upstream(messages::ack_message_delivered(&sender, &cookie));

        let _ = self.user_tx.send(message);
        Ok(())
    }

    fn handle_peer_hello(&mut self, message: &Envelope) -> Result<(), ClientError> {
        let peer = header_sender(message)?;
        let blob = message.payload_str("magic")?.to_string();
        tracing::debug!(peer = %peer, "handling peer hello");

        match self.sessions.state_of(&peer) {
            Some(SessionState::Pending) => {
                // Both parties started outbound sessions at the same time.
                tracing::info!(peer = %peer, "outbound session conflict");
                self.resolve_race_condition(&peer, &blob)?;
            }
            Some(SessionState::Active) => {
                // Internal error or a malicious peer; either way reset the
                // session by sending a nack.
                tracing::warn!(peer = %peer, "received hello from an active peer");
                self.queue_upstream(messages::nack_message_not_delivered(
                    &peer,
                    Some(self.identity.user_id()),
                    message.header.msg_id,
                    "",
                    "Session already established",
                ));
            }
            Some(SessionState::Potential) => {
                self.sessions.activate_inbound(&peer, &blob)?;
                self.queue_upstream(messages::session_established(&peer));
            }
            None => {
                // Hello from a user we know nothing about.
                tracing::debug!(peer = %peer, "received hello from an unknown user");
                self.sessions.activate_inbound(&peer, &blob)?;
                self.queue_upstream(messages::session_established(&peer));
                // Their keys did not come through a subscription; watch for
                // their logout so the session does not silently go stale.
                self.queue_upstream(messages::request_logout_notif(&peer));
            }
        }
        Ok(())
    }

    /// Tie-break: the lexicographically smaller user id keeps its outbound
    /// pending session, the other party forfeits and accepts inbound.
    fn resolve_race_condition(&mut self, peer: &str, blob: &str) -> Result<(), ClientError> {
        if self.identity.user_id() < peer {
            tracing::debug!(peer = %peer, "keeping pending outbound session");
            return Ok(());
        }

        tracing::info!(
            peer = %peer,
            "forfeiting pending outbound session and accepting inbound"
        );
        let forfeited = self.sessions.activate_inbound(peer, blob)?;
        self.queue_upstream(messages::session_established(peer));
        // Re-submit messages buffered behind the forfeited session; they
        // flow through the now-active inbound session in order.
        for message in forfeited {
            self.queue_upstream(message);
        }
        Ok(())
    }

    fn handle_session_established(&mut self, message: &Envelope) -> Result<(), ClientError> {
        let peer = header_sender(message)?;
        let blob = message.payload_str("magic")?.to_string();
        tracing::debug!(peer = %peer, "handling session established");

        let pending = self.sessions.mark_outbound_active(&peer, &blob)?;
        let count = pending.len();
        for buffered in pending {
            self.queue_upstream(buffered);
        }
        tracing::debug!(peer = %peer, count, "session activated; flushed buffered messages");
        Ok(())
    }

    fn handle_peer_login(&mut self, message: Envelope) -> Result<(), ClientError> {
        let peer = message.payload_str("peer")?.to_string();
        let bundle = key_bundle(&message)?;
        tracing::info!(peer = %peer, "peer logged in");

        match bundle.one_time_key {
            Some(one_time_key) => {
                self.sessions
                    .add_potential(&peer, &bundle.identity_key, &one_time_key);
            }
            None => {
                // The relay's pool for this peer was empty; ask again rather
                // than building a session from half a bundle.
                tracing::info!(peer = %peer, "login bundle without one-time key; re-requesting");
                self.queue_upstream(messages::get_one_time_key_req(&peer));
            }
        }
        let _ = self.system_tx.send(message);
        Ok(())
    }

    fn handle_peer_logout(&mut self, message: Envelope) -> Result<(), ClientError> {
        let peer = message.payload_str("peer")?.to_string();
        self.sessions.terminate(&peer);
        tracing::info!(peer = %peer, "peer logged out");
        let _ = self.system_tx.send(message);
        Ok(())
    }

    fn handle_share_friend(&mut self, mut message: Envelope) -> Result<(), ClientError> {
        let sender = header_sender(&message)?;
        let sealed = message.payload_str("name")?.to_string();
        let name = self.sessions.decrypt_from(&sender, &sealed)?;
        message.set_payload("name", json!(name));

        tracing::info!(
            sender = %sender,
            friend = %message.payload_str("friend").unwrap_or_default(),
            "peer shared a friend"
        );
        // 'Friends' are an upper-layer concept; just pass it up.
        let _ = self.system_tx.send(message);
        Ok(())
    }

    fn handle_ack(&mut self, message: Envelope) -> Result<(), ClientError> {
        tracing::debug!(
            sender = ?message.header.sender,
            cookie = %message.payload_str("cookie")?,
            "delivery acknowledged"
        );
        let _ = self.system_tx.send(message);
        Ok(())
    }

    fn handle_nack(&mut self, message: Envelope) -> Result<(), ClientError> {
        let target = match message.payload_value("message_target")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            _ => return Err(ProtoError::MissingField("message_target".into()).into()),
        };
        let reason = message.payload_str("reason")?.to_string();
        let nacked_id = u16::try_from(message.payload_u64("msg_id")?)
            .ok()
            .and_then(|raw| MsgId::try_from(raw).ok())
            .ok_or_else(|| ProtoError::MissingField("msg_id".into()))?;

        match (&message.header.sender, &target) {
            (None, _) => {
                // The relay could not route the message at all.
                tracing::warn!(target = ?target, reason = %reason, "relay failed to route message");
            }
            (Some(sender), Some(target)) if sender == target => {
                // Routed fine, but the peer could not decrypt it.
                tracing::warn!(peer = %sender, reason = %reason, "session error reported by peer");
                self.reset_peer_session(sender);
            }
            (Some(sender), _) => {
                // Header and payload disagree; neither can be trusted. The
                // relay should never have routed this.
                tracing::warn!(
                    sender = %sender,
                    target = ?target,
                    "nack spoofing attempt detected clientside"
                );
            }
        }

        // Surface delivery failures the UI can act on.
        if matches!(nacked_id, MsgId::UserMessage | MsgId::GetOneTimeKeyReq) {
            let _ = self.system_tx.send(message);
        }
        Ok(())
    }

    fn handle_replenish_req(&mut self, message: &Envelope) -> Result<(), ClientError> {
        let count = usize::try_from(message.payload_u64("count")?)
            .map_err(|_| ProtoError::MissingField("count".into()))?;
        tracing::debug!(count, "replenishing one-time keys");

        let one_time_keys = self.sessions.publish_one_time_keys(count);
        self.queue_upstream(messages::replenish_one_time_keys_resp(&one_time_keys));
        Ok(())
    }

    fn handle_get_one_time_key_resp(&mut self, message: &Envelope) -> Result<(), ClientError> {
        let peer = message.payload_str("peer")?.to_string();
        let bundle = key_bundle(message)?;

        match bundle.one_time_key {
            Some(one_time_key) => {
                self.sessions
                    .add_potential(&peer, &bundle.identity_key, &one_time_key);
                tracing::info!(peer = %peer, "restored potential session");
            }
            None => {
                tracing::warn!(peer = %peer, "one-time key request returned an empty bundle");
            }
        }
        Ok(())
    }

    fn handle_active_friends(&mut self, message: Envelope) -> Result<(), ClientError> {
        let friends: BTreeMap<String, KeyBundle> =
            serde_json::from_value(message.payload_value("friends")?.clone())
                .map_err(|_| ProtoError::MissingField("friends".into()))?;

        for (peer, bundle) in &friends {
            match &bundle.one_time_key {
                Some(one_time_key) => {
                    self.sessions
                        .add_potential(peer, &bundle.identity_key, one_time_key);
                }
                None => {
                    tracing::info!(peer = %peer, "friend bundle without one-time key; re-requesting");
                    self.queue_upstream(messages::get_one_time_key_req(peer));
                }
            }
        }
        tracing::debug!(count = friends.len(), "active friends recorded");
        let _ = self.system_tx.send(message);
        Ok(())
    }

    // ── Shared plumbing ───────────────────────────────────────────────────

    /// Drop the crypto session with a peer and ask for a fresh one-time key
    /// so a new handshake can be attempted.
    fn reset_peer_session(&mut self, peer: &str) {
        tracing::info!(peer = %peer, "resetting peer session");
        self.sessions.terminate(peer);
        self.queue_upstream(messages::get_one_time_key_req(peer));
    }

    fn queue_upstream(&self, message: Envelope) {
        // The manager owns the receiving end; this only fails at teardown.
        let _ = self.upstream_tx.send(message);
    }
}

fn header_sender(message: &Envelope) -> Result<String, ClientError> {
    message
        .header
        .sender
        .clone()
        .ok_or_else(|| ProtoError::MissingField("sender".into()).into())
}

fn key_bundle(message: &Envelope) -> Result<KeyBundle, ClientError> {
    serde_json::from_value(message.payload_value("public_keys_bundle")?.clone())
        .map_err(|_| ProtoError::MissingField("public_keys_bundle".into()).into())
}

async fn send_frame<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ClientError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(envelope::serialize(envelope)))
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))
}

async fn recv_frame(stream: &mut WsStream) -> Result<Envelope, ClientError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(envelope::deserialize(&text)?),
            Some(Ok(Message::Close(frame))) => {
                let detail = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no close frame".into());
                return Err(ClientError::Handshake(format!(
                    "relay closed the connection: {detail}"
                )));
            }
            Some(Ok(_)) => {} // ping/pong/binary
            Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
            None => return Err(ClientError::Transport("connection lost".into())),
        }
    }
}
