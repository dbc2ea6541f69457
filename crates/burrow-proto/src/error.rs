use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    /// The frame was not valid JSON at all.
    #[error("JSON deserialization failed: {0}")]
    Deserialization(String),

    /// The frame was JSON but violated the envelope shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A payload field required by the message id was absent or mistyped.
    #[error("payload field missing or mistyped: {0}")]
    MissingField(String),

    #[error("unknown message id: {0}")]
    UnknownMsgId(u16),
}
