//! Peer sessions state machine.
//!
//! Each peer is in one of three states (absence means no record):
//!
//! * **Potential**: the peer's published keys are known but no crypto
//!   context exists yet.
//! * **Pending**: an outbound ratchet was started and a hello sent; user
//!   messages are buffered until the peer acknowledges.
//! * **Active**: both sides hold the same chains; traffic flows encrypted.
//!
//! ```text
//!                     outbound user message
//! POTENTIAL SESSION ------------------------> PENDING SESSION
//!
//!                     session established ack
//! PENDING SESSION --------------------------> ACTIVE SESSION
//!
//!                     inbound prekey hello
//! POTENTIAL SESSION ------------------------> ACTIVE SESSION
//! ```
//!
//! The enum-per-peer representation makes the "at most one state per peer"
//! invariant structural.

use std::collections::{BTreeMap, HashMap};

use burrow_crypto::{RatchetAccount, RatchetSession};
use burrow_proto::{Envelope, PEER_HANDSHAKE_MAGIC};

use crate::error::ClientError;

/// One peer's session record.
pub enum PeerSession {
    /// Keys known, no crypto context.
    Potential {
        identity_key: String,
        one_time_key: String,
    },
    /// Outbound ratchet started, awaiting the peer's acknowledgement.
    Pending {
        ratchet: RatchetSession,
        buffered: Vec<Envelope>,
    },
    /// Fully established.
    Active { ratchet: RatchetSession },
}

/// Discriminant-only view of a peer's state, for dispatch and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Potential,
    Pending,
    Active,
}

pub struct SessionsStateMachine {
    account: RatchetAccount,
    sessions: HashMap<String, PeerSession>,
}

impl SessionsStateMachine {
    pub fn new(account: RatchetAccount) -> Self {
        Self {
            account,
            sessions: HashMap::new(),
        }
    }

    /// The account's long-lived ratchet identity key.
    pub fn identity_key(&self) -> &str {
        self.account.identity_key()
    }

    /// Generate and publish a batch of one-time keys.
    pub fn publish_one_time_keys(&mut self, count: usize) -> BTreeMap<String, String> {
        self.account.publish_one_time_keys(count)
    }

    /// Current state of the record for `peer`, if any.
    pub fn state_of(&self, peer: &str) -> Option<SessionState> {
        self.sessions.get(peer).map(|session| match session {
            PeerSession::Potential { .. } => SessionState::Potential,
            PeerSession::Pending { .. } => SessionState::Pending,
            PeerSession::Active { .. } => SessionState::Active,
        })
    }

    /// Record a peer's published keys. Replaces any existing record: fresh
    /// keys supersede whatever context was there.
    pub fn add_potential(&mut self, peer: &str, identity_key: &str, one_time_key: &str) {
        self.sessions.insert(
            peer.to_string(),
            PeerSession::Potential {
                identity_key: identity_key.to_string(),
                one_time_key: one_time_key.to_string(),
            },
        );
    }

    /// Transition Potential -> Pending: build the outbound ratchet from the
    /// stored keys and buffer the triggering user message.
    pub fn make_pending(&mut self, peer: &str, message: Envelope) -> Result<(), ClientError> {
        let Some(PeerSession::Potential {
            identity_key,
            one_time_key,
        }) = self.sessions.remove(peer)
        else {
            return Err(ClientError::Session(format!(
                "make_pending called for '{peer}' without a potential session"
            )));
        };

        let ratchet = RatchetSession::start_outbound(&self.account, &identity_key, &one_time_key)?;
        self.sessions.insert(
            peer.to_string(),
            PeerSession::Pending {
                ratchet,
                buffered: vec![message],
            },
        );
        Ok(())
    }

    /// Buffer another user message behind a pending session.
    pub fn buffer_message(&mut self, peer: &str, message: Envelope) -> Result<(), ClientError> {
        match self.sessions.get_mut(peer) {
            Some(PeerSession::Pending { buffered, .. }) => {
                buffered.push(message);
                Ok(())
            }
            _ => Err(ClientError::Session(format!(
                "buffer_message called for '{peer}' without a pending session"
            ))),
        }
    }

    /// Activate an inbound session from a received prekey hello, verifying
    /// the handshake magic. Any previous record is dropped; a forfeited
    /// pending session's buffer is returned for re-submission.
    pub fn activate_inbound(
        &mut self,
        peer: &str,
        prekey_blob: &str,
    ) -> Result<Vec<Envelope>, ClientError> {
        let buffered = match self.sessions.remove(peer) {
            Some(PeerSession::Pending { buffered, .. }) => buffered,
            _ => Vec::new(),
        };

        let (ratchet, plaintext) = RatchetSession::start_inbound(&mut self.account, prekey_blob)?;
        if plaintext != PEER_HANDSHAKE_MAGIC {
            return Err(ClientError::Session(format!(
                "handshake magic mismatch in hello from '{peer}'"
            )));
        }

        self.sessions
            .insert(peer.to_string(), PeerSession::Active { ratchet });
        Ok(buffered)
    }

    /// Transition Pending -> Active on the peer's acknowledgement, verifying
    /// the handshake magic. Returns the buffered messages for flushing, in
    /// submission order.
    pub fn mark_outbound_active(
        &mut self,
        peer: &str,
        ack_blob: &str,
    ) -> Result<Vec<Envelope>, ClientError> {
        let Some(PeerSession::Pending {
            mut ratchet,
            buffered,
        }) = self.sessions.remove(peer)
        else {
            return Err(ClientError::Session(format!(
                "session-established ack from '{peer}' without a pending session"
            )));
        };

        match ratchet.decrypt(ack_blob) {
            Ok(plaintext) if plaintext == PEER_HANDSHAKE_MAGIC => {
                self.sessions
                    .insert(peer.to_string(), PeerSession::Active { ratchet });
                Ok(buffered)
            }
            Ok(_) => Err(ClientError::Session(format!(
                "handshake magic mismatch in ack from '{peer}'"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt a plaintext for a peer with a pending or active session.
    pub fn encrypt_for(&mut self, peer: &str, plaintext: &str) -> Result<String, ClientError> {
        match self.sessions.get_mut(peer) {
            Some(PeerSession::Pending { ratchet, .. } | PeerSession::Active { ratchet }) => {
                Ok(ratchet.encrypt(plaintext)?)
            }
            _ => Err(ClientError::Session(format!(
                "no encryption context for peer '{peer}'"
            ))),
        }
    }

    /// Decrypt a ciphertext from a peer with a pending or active session.
    pub fn decrypt_from(&mut self, peer: &str, ciphertext: &str) -> Result<String, ClientError> {
        match self.sessions.get_mut(peer) {
            Some(PeerSession::Pending { ratchet, .. } | PeerSession::Active { ratchet }) => {
                Ok(ratchet.decrypt(ciphertext)?)
            }
            _ => Err(ClientError::Session(format!(
                "no decryption context for peer '{peer}'"
            ))),
        }
    }

    /// Drop the record for a peer, whatever its state.
    pub fn terminate(&mut self, peer: &str) {
        self.sessions.remove(peer);
    }
}
