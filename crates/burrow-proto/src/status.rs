/// WebSocket close codes used by the relay.
///
/// The three-code discipline is part of the observable protocol: clients key
/// their error reporting off these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Schnorr identification failed.
    AuthFailure,
    /// An unhandled serverside error occurred.
    ServerException,
    /// The peer sent a frame that failed envelope validation.
    MalformedMessage,
}

impl CloseReason {
    /// The close code sent on the wire.
    pub fn code(self) -> u16 {
        match self {
            Self::AuthFailure => 3000,
            Self::ServerException => 3001,
            Self::MalformedMessage => 3002,
        }
    }

    /// Human-readable close reason.
    pub fn reason(self) -> &'static str {
        match self {
            Self::AuthFailure => "Authentication failed",
            Self::ServerException => "Serverside exception",
            Self::MalformedMessage => "Malformed message",
        }
    }
}
