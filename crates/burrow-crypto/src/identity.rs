use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::{NonZeroScalar, PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// A user's long-term signing identity on P-256 (prime256v1).
///
/// There are no usernames; identity IS the keypair. The user id routed by
/// the relay is the SHA-256 digest of the PEM-encoded public key.
pub struct Identity {
    secret: SecretKey,
    public_pem: String,
    user_id: String,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = SecretKey::random(&mut OsRng);
        Self::from_secret(secret)
    }

    /// Restore an identity from a PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(format!("private key PEM: {e}")))?;
        Self::from_secret(secret)
    }

    fn from_secret(secret: SecretKey) -> Result<Self, CryptoError> {
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(format!("public key PEM: {e}")))?;
        let user_id = digest_key(&public_pem);
        Ok(Self {
            secret,
            public_pem,
            user_id,
        })
    }

    /// PKCS#8 PEM encoding of the private key (for at-rest storage).
    pub fn private_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(format!("private key PEM: {e}")))
    }

    /// SPKI PEM encoding of the public key, as sent on the wire.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// The routing id: lowercase hex SHA-256 over the public key PEM.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The private scalar, used by the Schnorr prover.
    pub fn private_scalar(&self) -> NonZeroScalar {
        self.secret.to_nonzero_scalar()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Digest a PEM-encoded public key into a user id.
pub fn digest_key(pem: &str) -> String {
    hex::encode(Sha256::digest(pem.as_bytes()))
}

/// Parse a PEM-encoded public key.
pub fn public_key_from_pem(pem: &str) -> Result<PublicKey, CryptoError> {
    PublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::InvalidKey(format!("public key PEM: {e}")))
}
