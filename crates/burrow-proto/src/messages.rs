//! Constructors for every message in the closed wire set.
//!
//! The relay and the client both build envelopes exclusively through these
//! functions so that payload schemas stay in one place.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::envelope::Envelope;
use crate::msg_id::MsgId;

/// Fixed plaintext both peers encrypt during the peer-to-peer handshake.
/// Equality after decryption proves the ratchet was keyed consistently.
pub const PEER_HANDSHAKE_MAGIC: &str = "PeerHandshakeMagic";

/// A peer's published ratchet keys as vended by the relay.
///
/// `one_time_key == None` signals pool exhaustion; the client reacts with a
/// fresh `GetOneTimeKeyReq` instead of building a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub identity_key: String,
    pub one_time_key: Option<String>,
}

/// Digest a user message into an opaque delivery-tracking token.
///
/// The cookie is echoed in acks and nacks so the sender can correlate
/// delivery state without relay-side receipts.
pub fn user_message_cookie(receiver: &str, text: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut hasher = Sha256::new();
    hasher.update(receiver.as_bytes());
    hasher.update(text.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

pub fn user_message(receiver: &str, text: &str) -> Envelope {
    let cookie = user_message_cookie(receiver, text);
    let mut env = Envelope::new(MsgId::UserMessage, None, Some(receiver.to_string()));
    env.set_payload("text", json!(text));
    env.set_payload("cookie", json!(cookie));
    env
}

pub fn peer_hello(receiver: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::PeerHello, None, Some(receiver.to_string()));
    env.set_payload("magic", json!(PEER_HANDSHAKE_MAGIC));
    env
}

pub fn session_established(receiver: &str) -> Envelope {
    let mut env = Envelope::new(
        MsgId::SessionEstablished,
        None,
        Some(receiver.to_string()),
    );
    env.set_payload("magic", json!(PEER_HANDSHAKE_MAGIC));
    env
}

pub fn ack_message_delivered(receiver: &str, cookie: &str) -> Envelope {
    let mut env = Envelope::new(
        MsgId::AckMessageDelivered,
        None,
        Some(receiver.to_string()),
    );
    env.set_payload("cookie", json!(cookie));
    env
}

pub fn nack_message_not_delivered(
    receiver: &str,
    message_target: Option<&str>,
    msg_id: MsgId,
    extra: &str,
    reason: &str,
) -> Envelope {
    let mut env = Envelope::new(
        MsgId::NackMessageNotDelivered,
        None,
        Some(receiver.to_string()),
    );
    env.set_payload("message_target", json!(message_target));
    env.set_payload("msg_id", json!(u16::from(msg_id)));
    env.set_payload("extra", json!(extra));
    env.set_payload("reason", json!(reason));
    env
}

pub fn schnorr_commit(public_key: &str, commitment: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::SchnorrCommit, None, None);
    env.set_payload("public_key", json!(public_key));
    env.set_payload("commitment", json!(commitment));
    env
}

pub fn schnorr_challenge(challenge: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::SchnorrChallenge, None, None);
    env.set_payload("challenge", json!(challenge));
    env
}

pub fn schnorr_response(
    response: &str,
    subscriptions: &[String],
    identity_key: &str,
    one_time_keys: &BTreeMap<String, String>,
) -> Envelope {
    let mut env = Envelope::new(MsgId::SchnorrResponse, None, None);
    env.set_payload("response", json!(response));
    env.set_payload("subscriptions", json!(subscriptions));
    env.set_payload("identity_key", json!(identity_key));
    env.set_payload("one_time_keys", json!(one_time_keys));
    env
}

pub fn peer_login(receiver: &str, peer: &str, bundle: &KeyBundle) -> Envelope {
    let mut env = Envelope::new(MsgId::PeerLogin, None, Some(receiver.to_string()));
    env.set_payload("peer", json!(peer));
    env.set_payload("public_keys_bundle", json!(bundle));
    env
}

pub fn peer_logout(receiver: &str, peer: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::PeerLogout, None, Some(receiver.to_string()));
    env.set_payload("peer", json!(peer));
    env
}

pub fn add_friend(friend: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::AddFriend, None, None);
    env.set_payload("friend", json!(friend));
    env
}

pub fn remove_friend(friend: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::RemoveFriend, None, None);
    env.set_payload("friend", json!(friend));
    env
}

pub fn request_logout_notif(peer: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::RequestLogoutNotif, None, None);
    env.set_payload("peer", json!(peer));
    env
}

pub fn active_friends(receiver: &str, friends: &BTreeMap<String, KeyBundle>) -> Envelope {
    let mut env = Envelope::new(MsgId::ActiveFriends, None, Some(receiver.to_string()));
    env.set_payload("friends", json!(friends));
    env
}

/// Relay-to-client only: `sender` stays unset.
pub fn replenish_one_time_keys_req(receiver: &str, count: usize) -> Envelope {
    let mut env = Envelope::new(
        MsgId::ReplenishOneTimeKeysReq,
        None,
        Some(receiver.to_string()),
    );
    env.set_payload("count", json!(count));
    env
}

pub fn replenish_one_time_keys_resp(one_time_keys: &BTreeMap<String, String>) -> Envelope {
    let mut env = Envelope::new(MsgId::ReplenishOneTimeKeysResp, None, None);
    env.set_payload("keys", json!(one_time_keys));
    env
}

pub fn get_one_time_key_req(peer: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::GetOneTimeKeyReq, None, None);
    env.set_payload("peer", json!(peer));
    env
}

pub fn get_one_time_key_resp(receiver: &str, peer: &str, bundle: &KeyBundle) -> Envelope {
    let mut env = Envelope::new(
        MsgId::GetOneTimeKeyResp,
        None,
        Some(receiver.to_string()),
    );
    env.set_payload("peer", json!(peer));
    env.set_payload("public_keys_bundle", json!(bundle));
    env
}

pub fn add_blacklist(users: &[String]) -> Envelope {
    let mut env = Envelope::new(MsgId::AddBlacklist, None, None);
    env.set_payload("users", json!(users));
    env
}

pub fn remove_blacklist(users: &[String]) -> Envelope {
    let mut env = Envelope::new(MsgId::RemoveBlacklist, None, None);
    env.set_payload("users", json!(users));
    env
}

/// Share one friend's id with a peer. The local display name is encrypted
/// before it leaves the client.
pub fn share_friend(receiver: &str, friend: &str, name: &str) -> Envelope {
    let mut env = Envelope::new(MsgId::ShareFriend, None, Some(receiver.to_string()));
    env.set_payload("friend", json!(friend));
    env.set_payload("name", json!(name));
    env
}
