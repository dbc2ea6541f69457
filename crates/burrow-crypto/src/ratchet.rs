//! Double-ratchet sessions keyed by an X3DH-style agreement.
//!
//! An outbound session is built from a peer's published `(identity_key,
//! one_time_key)` bundle and emits prekey-wrapped ciphertext until the first
//! successful inbound decrypt proves the peer holds the same chains. An
//! inbound session is built directly from a received prekey message. Chain
//! keys advance through HKDF-SHA256; message bodies are sealed with
//! AES-256-GCM. Out-of-order ciphertext is tolerated within a bounded
//! skipped-key window.

use std::collections::{BTreeMap, HashMap};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

const X3DH_INFO: &[u8] = b"BurrowX3DH";
const MSG_KEY_INFO: &[u8] = b"BurrowMsgKey";
const CHAIN_KEY_INFO: &[u8] = b"BurrowChainKey";

/// Upper bound on cached skipped message keys per session. Ciphertext farther
/// ahead than this is undecryptable and treated as a session error.
const MAX_SKIP: u64 = 64;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// A ratchet identity plus a pool of one-time prekeys.
///
/// Published one-time key secrets are retained (keyed by their public form)
/// until an inbound prekey message consumes them. Not re-entrant: callers
/// serialize access through the session manager's single-writer discipline.
pub struct RatchetAccount {
    identity_secret: StaticSecret,
    identity_public: String,
    published: HashMap<String, StaticSecret>,
    next_key_id: u64,
}

impl RatchetAccount {
    pub fn new() -> Self {
        let identity_secret = StaticSecret::random_from_rng(OsRng);
        let identity_public = B64.encode(X25519Public::from(&identity_secret).as_bytes());
        Self {
            identity_secret,
            identity_public,
            published: HashMap::new(),
            next_key_id: 0,
        }
    }

    /// The long-lived ratchet identity key (base64), published at login.
    pub fn identity_key(&self) -> &str {
        &self.identity_public
    }

    /// Generate `count` fresh one-time keys and mark them published.
    ///
    /// Returns `key_id -> public key` for upload to the relay. The secrets
    /// stay behind until consumed by an inbound handshake.
    pub fn publish_one_time_keys(&mut self, count: usize) -> BTreeMap<String, String> {
        let mut batch = BTreeMap::new();
        for _ in 0..count {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = B64.encode(X25519Public::from(&secret).as_bytes());
            let key_id = format!("otk-{}", self.next_key_id);
            self.next_key_id += 1;
            self.published.insert(public.clone(), secret);
            batch.insert(key_id, public);
        }
        batch
    }

    /// Consume the secret half of a published one-time key.
    fn take_one_time_secret(&mut self, public: &str) -> Option<StaticSecret> {
        self.published.remove(public)
    }

    fn identity_diffie_hellman(&self, peer: &X25519Public) -> [u8; 32] {
        self.identity_secret.diffie_hellman(peer).to_bytes()
    }
}

impl Default for RatchetAccount {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RatchetAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetAccount")
            .field("identity_key", &self.identity_public)
            .field("published", &self.published.len())
            .finish()
    }
}

/// A single sealed ratchet message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RatchetMessage {
    counter: u64,
    ciphertext: String,
}

/// The handshake form: a ratchet message plus the key agreement metadata the
/// receiver needs to derive the same chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrekeyMessage {
    identity_key: String,
    ephemeral_key: String,
    one_time_key: String,
    message: RatchetMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Prekey(PrekeyMessage),
    Ratchet(RatchetMessage),
}

/// Handshake metadata replayed in every outbound message until the session
/// is established.
struct HandshakeMeta {
    identity_key: String,
    ephemeral_key: String,
    one_time_key: String,
}

/// A per-peer double-ratchet session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RatchetSession {
    sending_chain: [u8; 32],
    receiving_chain: [u8; 32],
    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    recv_counter: u64,
    /// Message keys derived for counters that arrived out of order.
    #[zeroize(skip)]
    skipped: HashMap<u64, [u8; 32]>,
    /// Present on outbound sessions until the first inbound decrypt.
    #[zeroize(skip)]
    handshake: Option<HandshakeMeta>,
}

impl RatchetSession {
    /// Start an outbound session from the peer's published bundle.
    ///
    /// Key agreement (initiator side, with ephemeral `e`, identity `i`):
    /// `DH1 = i * peer_otk`, `DH2 = e * peer_idk`, `DH3 = e * peer_otk`.
    pub fn start_outbound(
        account: &RatchetAccount,
        peer_identity_key: &str,
        peer_one_time_key: &str,
    ) -> Result<Self, CryptoError> {
        let peer_identity = decode_public(peer_identity_key)?;
        let peer_one_time = decode_public(peer_one_time_key)?;

        let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = B64.encode(X25519Public::from(&ephemeral_secret).as_bytes());

        let dh1 = account.identity_diffie_hellman(&peer_one_time);
        let dh2 = ephemeral_secret.diffie_hellman(&peer_identity).to_bytes();
        let dh3 = ephemeral_secret.diffie_hellman(&peer_one_time).to_bytes();

        // Root key reserved for future DH ratchet steps; the chains carry
        // all per-message derivation.
        let (_root, initiator_chain, responder_chain) = derive_chains(&dh1, &dh2, &dh3)?;

        Ok(Self {
            sending_chain: initiator_chain,
            receiving_chain: responder_chain,
            send_counter: 0,
            recv_counter: 0,
            skipped: HashMap::new(),
            handshake: Some(HandshakeMeta {
                identity_key: account.identity_key().to_string(),
                ephemeral_key: ephemeral_public,
                one_time_key: peer_one_time_key.to_string(),
            }),
        })
    }

    /// Start an inbound session from a received prekey message, consuming the
    /// referenced one-time key. Returns the session and the decrypted
    /// handshake plaintext for the caller to verify.
    pub fn start_inbound(
        account: &mut RatchetAccount,
        prekey_blob: &str,
    ) -> Result<(Self, String), CryptoError> {
        let WireMessage::Prekey(prekey) = decode_wire(prekey_blob)? else {
            return Err(CryptoError::SessionError(
                "expected a prekey message".into(),
            ));
        };

        let their_identity = decode_public(&prekey.identity_key)?;
        let their_ephemeral = decode_public(&prekey.ephemeral_key)?;
        let one_time_secret = account
            .take_one_time_secret(&prekey.one_time_key)
            .ok_or_else(|| {
                CryptoError::OneTimeKeyError("unknown or already consumed one-time key".into())
            })?;

        // Mirror of the initiator side.
        let dh1 = one_time_secret.diffie_hellman(&their_identity).to_bytes();
        let dh2 = account.identity_diffie_hellman(&their_ephemeral);
        let dh3 = one_time_secret.diffie_hellman(&their_ephemeral).to_bytes();

        let (_root, initiator_chain, responder_chain) = derive_chains(&dh1, &dh2, &dh3)?;

        let mut session = Self {
            // Responder swaps chains relative to the initiator.
            sending_chain: responder_chain,
            receiving_chain: initiator_chain,
            send_counter: 0,
            recv_counter: 0,
            skipped: HashMap::new(),
            handshake: None,
        };

        let plaintext = session.decrypt_ratchet(&prekey.message)?;
        Ok((session, plaintext))
    }

    /// Whether the peer has proven possession of the shared chains.
    pub fn is_established(&self) -> bool {
        self.handshake.is_none()
    }

    /// Encrypt a plaintext for the peer.
    ///
    /// Until the session is established the output is prekey-wrapped so the
    /// receiver can bootstrap its own half.
    pub fn encrypt(&mut self, plaintext: &str) -> Result<String, CryptoError> {
        let counter = self.send_counter;
        let message_key = advance_chain(&mut self.sending_chain, CryptoError::EncryptionError)?;
        self.send_counter += 1;

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let nonce_bytes = counter_nonce(counter);
        let ciphertext = cipher
            .encrypt(&Nonce::from(nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let message = RatchetMessage {
            counter,
            ciphertext: B64.encode(ciphertext),
        };

        let wire = match &self.handshake {
            Some(meta) => WireMessage::Prekey(PrekeyMessage {
                identity_key: meta.identity_key.clone(),
                ephemeral_key: meta.ephemeral_key.clone(),
                one_time_key: meta.one_time_key.clone(),
                message,
            }),
            None => WireMessage::Ratchet(message),
        };

        encode_wire(&wire)
    }

    /// Decrypt a ciphertext from the peer.
    ///
    /// The first successful decrypt establishes the session; outbound
    /// messages stop carrying handshake metadata from then on.
    pub fn decrypt(&mut self, blob: &str) -> Result<String, CryptoError> {
        // The prekey wrapping is redundant once chains exist: only the
        // embedded message matters. A wrongly keyed sender fails AEAD below.
        let message = match decode_wire(blob)? {
            WireMessage::Ratchet(message) => message,
            WireMessage::Prekey(prekey) => prekey.message,
        };
        let plaintext = self.decrypt_ratchet(&message)?;
        self.handshake = None;
        Ok(plaintext)
    }

    fn decrypt_ratchet(&mut self, message: &RatchetMessage) -> Result<String, CryptoError> {
        let message_key = self.message_key_for(message.counter)?;

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        let nonce_bytes = counter_nonce(message.counter);
        let ciphertext = B64
            .decode(&message.ciphertext)
            .map_err(|e| CryptoError::DecryptionError(format!("ciphertext base64: {e}")))?;

        let plaintext = cipher
            .decrypt(&Nonce::from(nonce_bytes), ciphertext.as_slice())
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionError(format!("plaintext not UTF-8: {e}")))
    }

    /// Resolve the message key for a counter, deriving and caching skipped
    /// keys as needed.
    fn message_key_for(&mut self, counter: u64) -> Result<[u8; 32], CryptoError> {
        if counter < self.recv_counter {
            return self.skipped.remove(&counter).ok_or_else(|| {
                CryptoError::DecryptionError(format!(
                    "message key for counter {counter} already consumed"
                ))
            });
        }

        if counter - self.recv_counter > MAX_SKIP
            || self.skipped.len() as u64 + (counter - self.recv_counter) > MAX_SKIP
        {
            return Err(CryptoError::DecryptionError(format!(
                "counter {counter} too far ahead of {}",
                self.recv_counter
            )));
        }

        if counter > self.recv_counter {
            tracing::debug!(
                counter,
                expected = self.recv_counter,
                "caching skipped message keys"
            );
        }
        while self.recv_counter < counter {
            let skipped_key =
                advance_chain(&mut self.receiving_chain, CryptoError::DecryptionError)?;
            self.skipped.insert(self.recv_counter, skipped_key);
            self.recv_counter += 1;
        }

        let message_key = advance_chain(&mut self.receiving_chain, CryptoError::DecryptionError)?;
        self.recv_counter += 1;
        Ok(message_key)
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("established", &self.is_established())
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

/// Derive `(root, initiator_chain, responder_chain)` from the DH outputs.
fn derive_chains(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
) -> Result<([u8; 32], [u8; 32], [u8; 32]), CryptoError> {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 96];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
    ikm.zeroize();

    let mut root = [0u8; 32];
    let mut initiator_chain = [0u8; 32];
    let mut responder_chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    initiator_chain.copy_from_slice(&okm[32..64]);
    responder_chain.copy_from_slice(&okm[64..96]);
    okm.zeroize();

    Ok((root, initiator_chain, responder_chain))
}

/// Step a chain key forward, returning the message key for the current step.
fn advance_chain(
    chain: &mut [u8; 32],
    wrap: fn(String) -> CryptoError,
) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain.as_slice());
    let mut message_key = [0u8; 32];
    let mut next_chain = [0u8; 32];
    hk.expand(MSG_KEY_INFO, &mut message_key)
        .map_err(|e| wrap(format!("HKDF: {e}")))?;
    hk.expand(CHAIN_KEY_INFO, &mut next_chain)
        .map_err(|e| wrap(format!("HKDF: {e}")))?;
    *chain = next_chain;
    Ok(message_key)
}

/// GCM nonce derived from the message counter; message keys are single-use
/// so the counter alone is sufficient.
fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn decode_public(encoded: &str) -> Result<X25519Public, CryptoError> {
    let bytes = B64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(format!("X25519 base64: {e}")))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("X25519 key must be 32 bytes".into()))?;
    Ok(X25519Public::from(array))
}

fn encode_wire(message: &WireMessage) -> Result<String, CryptoError> {
    let json = serde_json::to_vec(message)
        .map_err(|e| CryptoError::EncryptionError(format!("wire encode: {e}")))?;
    Ok(B64.encode(json))
}

fn decode_wire(blob: &str) -> Result<WireMessage, CryptoError> {
    let json = B64
        .decode(blob)
        .map_err(|e| CryptoError::DecryptionError(format!("wire base64: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| CryptoError::DecryptionError(format!("wire decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &str = "PeerHandshakeMagic";

    fn bundle(account: &mut RatchetAccount) -> (String, String) {
        let keys = account.publish_one_time_keys(1);
        let one_time = keys.values().next().unwrap().clone();
        (account.identity_key().to_string(), one_time)
    }

    #[test]
    fn handshake_agrees_on_magic() {
        let alice = RatchetAccount::new();
        let mut bob = RatchetAccount::new();
        let (bob_idk, bob_otk) = bundle(&mut bob);

        let mut outbound = RatchetSession::start_outbound(&alice, &bob_idk, &bob_otk).unwrap();
        let hello = outbound.encrypt(MAGIC).unwrap();

        let (mut inbound, plaintext) = RatchetSession::start_inbound(&mut bob, &hello).unwrap();
        assert_eq!(plaintext, MAGIC);
        assert!(inbound.is_established());

        // Acknowledge back; first decrypt establishes the outbound side.
        let ack = inbound.encrypt(MAGIC).unwrap();
        assert!(!outbound.is_established());
        assert_eq!(outbound.decrypt(&ack).unwrap(), MAGIC);
        assert!(outbound.is_established());
    }

    #[test]
    fn bidirectional_traffic_after_establishment() {
        let alice = RatchetAccount::new();
        let mut bob = RatchetAccount::new();
        let (bob_idk, bob_otk) = bundle(&mut bob);

        let mut outbound = RatchetSession::start_outbound(&alice, &bob_idk, &bob_otk).unwrap();
        let hello = outbound.encrypt(MAGIC).unwrap();
        let (mut inbound, _) = RatchetSession::start_inbound(&mut bob, &hello).unwrap();
        let ack = inbound.encrypt(MAGIC).unwrap();
        outbound.decrypt(&ack).unwrap();

        for text in ["first", "second", "third"] {
            let sealed = outbound.encrypt(text).unwrap();
            assert_eq!(inbound.decrypt(&sealed).unwrap(), text);
            let reply = inbound.encrypt(text).unwrap();
            assert_eq!(outbound.decrypt(&reply).unwrap(), text);
        }
    }

    #[test]
    fn out_of_order_within_window() {
        let alice = RatchetAccount::new();
        let mut bob = RatchetAccount::new();
        let (bob_idk, bob_otk) = bundle(&mut bob);

        let mut outbound = RatchetSession::start_outbound(&alice, &bob_idk, &bob_otk).unwrap();
        let hello = outbound.encrypt(MAGIC).unwrap();
        let (mut inbound, _) = RatchetSession::start_inbound(&mut bob, &hello).unwrap();

        let first = outbound.encrypt("one").unwrap();
        let second = outbound.encrypt("two").unwrap();
        let third = outbound.encrypt("three").unwrap();

        assert_eq!(inbound.decrypt(&third).unwrap(), "three");
        assert_eq!(inbound.decrypt(&first).unwrap(), "one");
        assert_eq!(inbound.decrypt(&second).unwrap(), "two");
        // Replays are rejected: the key was consumed.
        assert!(inbound.decrypt(&second).is_err());
    }

    #[test]
    fn one_time_key_cannot_be_consumed_twice() {
        let alice = RatchetAccount::new();
        let carol = RatchetAccount::new();
        let mut bob = RatchetAccount::new();
        let (bob_idk, bob_otk) = bundle(&mut bob);

        let mut from_alice = RatchetSession::start_outbound(&alice, &bob_idk, &bob_otk).unwrap();
        let mut from_carol = RatchetSession::start_outbound(&carol, &bob_idk, &bob_otk).unwrap();

        let hello_a = from_alice.encrypt(MAGIC).unwrap();
        let hello_c = from_carol.encrypt(MAGIC).unwrap();

        assert!(RatchetSession::start_inbound(&mut bob, &hello_a).is_ok());
        let err = RatchetSession::start_inbound(&mut bob, &hello_c).unwrap_err();
        assert!(matches!(err, CryptoError::OneTimeKeyError(_)));
    }

    #[test]
    fn tampered_ciphertext_is_a_decryption_error() {
        let alice = RatchetAccount::new();
        let mut bob = RatchetAccount::new();
        let (bob_idk, bob_otk) = bundle(&mut bob);

        let mut outbound = RatchetSession::start_outbound(&alice, &bob_idk, &bob_otk).unwrap();
        let hello = outbound.encrypt(MAGIC).unwrap();
        let (mut inbound, _) = RatchetSession::start_inbound(&mut bob, &hello).unwrap();

        let sealed = outbound.encrypt("hello").unwrap();
        // Corrupt the sealed blob while keeping it valid base64.
        let mut corrupted = B64.decode(&sealed).unwrap();
        let last = corrupted.len() - 10;
        corrupted[last] ^= 0x55;
        let corrupted = B64.encode(corrupted);

        assert!(inbound.decrypt(&corrupted).is_err());
    }

    #[test]
    fn published_keys_have_unique_ids() {
        let mut account = RatchetAccount::new();
        let first = account.publish_one_time_keys(5);
        let second = account.publish_one_time_keys(5);
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 5);
        assert!(first.keys().all(|id| !second.contains_key(id)));
    }
}
