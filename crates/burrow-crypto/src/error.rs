use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid scalar encoding: {0}")]
    InvalidScalar(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("ratchet session error: {0}")]
    SessionError(String),

    #[error("one-time key error: {0}")]
    OneTimeKeyError(String),
}
