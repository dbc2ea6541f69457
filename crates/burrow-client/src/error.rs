use thiserror::Error;

use burrow_crypto::CryptoError;
use burrow_proto::ProtoError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Ratchet failure in a peer session; recoverable via nack-and-reset.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Peer-session state machine inconsistency or handshake-magic mismatch.
    #[error("session error: {0}")]
    Session(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("local store error: {0}")]
    Store(String),
}

impl ClientError {
    /// Whether this error is recoverable through the nack-and-reset flow
    /// rather than a peer-side malfunction.
    pub fn is_session_error(&self) -> bool {
        matches!(self, Self::Crypto(_) | Self::Session(_))
    }
}
