//! Connection listener: TLS accept, Schnorr identification, handoff.
//!
//! A failure at any stage closes that one socket with the mapped status code
//! and never disturbs other connections.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use burrow_crypto::{digest_key, schnorr};
use burrow_proto::{envelope, messages, CloseReason, Envelope, MsgId, ProtoError};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::event::SessionEvent;
use crate::router::RoutingEngine;
use crate::session::RelaySession;
use crate::{downstream, upstream};

pub type WsStream = WebSocketStream<tokio_native_tls::TlsStream<TcpStream>>;

/// Everything learned about a client during identification.
struct Admission {
    user_id: String,
    subscriptions: HashSet<String>,
    identity_key: String,
    one_time_keys: Vec<String>,
}

pub struct ConnectionListener {
    config: ServerConfig,
    router: Arc<RoutingEngine>,
}

impl ConnectionListener {
    pub fn new(config: ServerConfig, router: Arc<RoutingEngine>) -> Self {
        Self { config, router }
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let acceptor = self.build_acceptor()?;
        let listener =
            TcpListener::bind((self.config.hostname.as_str(), self.config.port)).await?;
        tracing::info!(
            host = %self.config.hostname,
            port = self.config.port,
            "listening for connections"
        );

        loop {
            match listener.accept().await {
                Ok((tcp, addr)) => {
                    let acceptor = acceptor.clone();
                    let router = Arc::clone(&self.router);
                    tokio::spawn(async move {
                        handle_connection(acceptor, tcp, addr, router).await;
                    });
                }
                Err(e) => {
                    // Transient (EMFILE and friends); existing connections
                    // are unaffected.
                    tracing::warn!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    fn build_acceptor(&self) -> Result<tokio_native_tls::TlsAcceptor, ServerError> {
        let cert = std::fs::read(&self.config.cert_path)?;
        let key = std::fs::read(&self.config.key_path)?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        let acceptor = native_tls::TlsAcceptor::new(identity)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        tracing::info!("TLS acceptor ready");
        Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
    }
}

async fn handle_connection(
    acceptor: tokio_native_tls::TlsAcceptor,
    tcp: TcpStream,
    addr: SocketAddr,
    router: Arc<RoutingEngine>,
) {
    tracing::debug!(%addr, "accepted connection");

    let tls = match acceptor.accept(tcp).await {
        Ok(tls) => tls,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "TLS handshake failed");
            return;
        }
    };
    let mut ws = match tokio_tungstenite::accept_async(tls).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    match authenticate(&mut ws).await {
        Ok(admission) => {
            tracing::debug!(%addr, user = %admission.user_id, "client authenticated");
            if let Err(e) = serve(ws, admission, router).await {
                tracing::info!(%addr, error = %e, "connection ended");
            }
        }
        Err(e) => {
            let reason = e.close_reason();
            tracing::error!(%addr, error = %e, code = reason.code(), "identification failed");
            close_with(&mut ws, reason).await;
        }
    }
}

/// Run the verifier role of the Schnorr identification protocol.
async fn authenticate(ws: &mut WsStream) -> Result<Admission, ServerError> {
    let commit = recv_frame(ws).await?;
    if commit.header.msg_id != MsgId::SchnorrCommit {
        return Err(ProtoError::Malformed("expected a Schnorr commitment".into()).into());
    }
    let public_key = commit.payload_str("public_key")?.to_string();
    let commitment = commit.payload_str("commitment")?.to_string();

    let challenge = schnorr::challenge();
    send_frame(
        ws,
        &messages::schnorr_challenge(&schnorr::scalar_to_hex(&challenge)),
    )
    .await?;

    let response = recv_frame(ws).await?;
    if response.header.msg_id != MsgId::SchnorrResponse {
        return Err(ProtoError::Malformed("expected a Schnorr response".into()).into());
    }
    let proof = schnorr::scalar_from_hex(response.payload_str("response")?)
        .map_err(|e| ProtoError::Malformed(e.to_string()))?;

    let valid = schnorr::verify(&public_key, &commitment, &challenge, &proof)
        .map_err(|e| ProtoError::Malformed(e.to_string()))?;
    if !valid {
        return Err(ServerError::AuthFailure(digest_key(&public_key)));
    }

    // The response piggy-backs the ratchet bootstrap.
    let subscriptions: HashSet<String> =
        serde_json::from_value(response.payload_value("subscriptions")?.clone())
            .map_err(|_| ProtoError::MissingField("subscriptions".into()))?;
    let identity_key = response.payload_str("identity_key")?.to_string();
    let one_time_keys: BTreeMap<String, String> =
        serde_json::from_value(response.payload_value("one_time_keys")?.clone())
            .map_err(|_| ProtoError::MissingField("one_time_keys".into()))?;

    Ok(Admission {
        user_id: digest_key(&public_key),
        subscriptions,
        identity_key,
        one_time_keys: one_time_keys.into_values().collect(),
    })
}

/// Register the session and run both traffic handlers until either fails.
async fn serve(
    mut ws: WsStream,
    admission: Admission,
    router: Arc<RoutingEngine>,
) -> Result<(), ServerError> {
    let session = Arc::new(RelaySession::new(
        admission.user_id,
        admission.subscriptions,
        admission.identity_key,
        admission.one_time_keys,
    ));

    let active_friends = match router.admit(&session) {
        Ok(active_friends) => active_friends,
        Err(e) => {
            close_with(&mut ws, e.close_reason()).await;
            return Err(e);
        }
    };
    if let Err(e) = send_frame(
        &mut ws,
        &messages::active_friends(&session.user_id, &active_friends),
    )
    .await
    {
        router.disconnect(&session.user_id);
        return Err(e);
    }

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(downstream::run(
        sink,
        Arc::clone(&session),
        Arc::clone(&router),
    ));

    let result = upstream::run(stream, Arc::clone(&session), Arc::clone(&router)).await;
    if let Err(ref e) = result {
        // Hand the close frame to the writer before tearing the queue down.
        let _ = session.send_event(SessionEvent::Close(e.close_reason()));
    }

    // Logout fan-out, then let the writer drain what remains and exit.
    router.disconnect(&session.user_id);
    session.close_event_queue();
    let _ = writer.await;

    result
}

async fn close_with(ws: &mut WsStream, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.reason().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!(error = %e, "failed to send close frame");
    }
}

async fn send_frame(ws: &mut WsStream, message: &Envelope) -> Result<(), ServerError> {
    ws.send(Message::Text(envelope::serialize(message)))
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))
}

async fn recv_frame(ws: &mut WsStream) -> Result<Envelope, ServerError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(envelope::deserialize(&text)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ServerError::Transport(
                    "connection closed during identification".into(),
                ))
            }
            Some(Ok(_)) => {} // ping/pong/binary
            Some(Err(e)) => return Err(ServerError::Transport(e.to_string())),
        }
    }
}
