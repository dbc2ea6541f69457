use thiserror::Error;

use burrow_proto::{CloseReason, ProtoError};

#[derive(Debug, Error)]
pub enum ServerError {
    /// Schnorr verification failed.
    #[error("authentication failed for {0}")]
    AuthFailure(String),

    /// Envelope shape or payload schema violation.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// `header.sender` did not match the authenticated session.
    #[error("spoofed sender: claimed {claimed:?}, session belongs to {actual}")]
    Spoofing {
        claimed: Option<String>,
        actual: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// The close code a connection is terminated with when this error is
    /// fatal for it. Spoofing is deliberately indistinguishable from any
    /// other malformed message.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::AuthFailure(_) => CloseReason::AuthFailure,
            Self::Proto(_) | Self::Spoofing { .. } => CloseReason::MalformedMessage,
            _ => CloseReason::ServerException,
        }
    }
}
