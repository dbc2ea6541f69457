//! Non-interactive three-pass Schnorr identification over P-256.
//!
//! Commit: the prover samples an ephemeral keypair `(r, R)` and sends `R`.
//! Challenge: the verifier samples a random scalar `c`.
//! Response: the prover sends `s = r + d*c mod n`.
//! Verify: accept iff `s*G == R + c*P`.
//!
//! Scalars cross the wire as lowercase hex (JSON numbers cannot carry
//! 256-bit integers).

use p256::elliptic_curve::PrimeField;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::{FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// The prover's half of the commit pass: the ephemeral secret is kept until
/// the response is computed, the PEM-encoded point goes on the wire.
pub struct Commitment {
    pub secret: NonZeroScalar,
    pub commitment_pem: String,
}

/// Generate a commitment `(r, R = r*G)`.
pub fn commitment() -> Result<Commitment, CryptoError> {
    let secret = NonZeroScalar::random(&mut OsRng);
    let point = PublicKey::from_secret_scalar(&secret);
    let commitment_pem = point
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGeneration(format!("commitment PEM: {e}")))?;
    Ok(Commitment {
        secret,
        commitment_pem,
    })
}

/// Sample a uniformly random challenge scalar.
///
/// A throwaway keypair's private scalar is uniform over the group order,
/// matching the commit-side construction.
pub fn challenge() -> NonZeroScalar {
    NonZeroScalar::random(&mut OsRng)
}

/// Compute the response `s = r + d*c mod n`.
pub fn response(private_key: &Scalar, ephemeral: &Scalar, challenge: &Scalar) -> Scalar {
    ephemeral + &(private_key * challenge)
}

/// Verify `s*G == R + c*P` against PEM-encoded `P` and `R`.
pub fn verify(
    public_key_pem: &str,
    commitment_pem: &str,
    challenge: &Scalar,
    response: &Scalar,
) -> Result<bool, CryptoError> {
    let public = PublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| CryptoError::InvalidKey(format!("prover public key: {e}")))?;
    let commit = PublicKey::from_public_key_pem(commitment_pem)
        .map_err(|e| CryptoError::InvalidKey(format!("commitment point: {e}")))?;

    let lhs = ProjectivePoint::GENERATOR * response;
    let rhs = commit.to_projective() + (public.to_projective() * challenge);

    Ok(lhs.to_affine() == rhs.to_affine())
}

/// Encode a scalar as lowercase hex (big-endian, 32 bytes).
pub fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

/// Decode a scalar from its hex wire form.
pub fn scalar_from_hex(encoded: &str) -> Result<Scalar, CryptoError> {
    let bytes = hex::decode(encoded)
        .map_err(|e| CryptoError::InvalidScalar(format!("hex decode: {e}")))?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidScalar(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidScalar("expected 32 bytes".into()))?;
    let repr = FieldBytes::from(array);
    Option::<Scalar>::from(Scalar::from_repr(repr))
        .ok_or_else(|| CryptoError::InvalidScalar("not a canonical field element".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn honest_prover_is_accepted() {
        let identity = Identity::generate().unwrap();
        let commit = commitment().unwrap();
        let c = challenge();

        let s = response(
            &identity.private_scalar(),
            &commit.secret,
            &c,
        );

        assert!(verify(
            identity.public_pem(),
            &commit.commitment_pem,
            &c,
            &s,
        )
        .unwrap());
    }

    #[test]
    fn tampered_response_is_rejected() {
        let identity = Identity::generate().unwrap();
        let commit = commitment().unwrap();
        let c = challenge();

        let s = response(&identity.private_scalar(), &commit.secret, &c);
        let tampered = s + Scalar::ONE;

        assert!(!verify(
            identity.public_pem(),
            &commit.commitment_pem,
            &c,
            &tampered,
        )
        .unwrap());
    }

    #[test]
    fn wrong_private_key_is_rejected() {
        let identity = Identity::generate().unwrap();
        let impostor = Identity::generate().unwrap();
        let commit = commitment().unwrap();
        let c = challenge();

        // Impostor computes the response with their own key against the
        // honest party's public key.
        let s = response(&impostor.private_scalar(), &commit.secret, &c);

        assert!(!verify(
            identity.public_pem(),
            &commit.commitment_pem,
            &c,
            &s,
        )
        .unwrap());
    }

    #[test]
    fn scalar_hex_round_trip() {
        let c = challenge();
        let encoded = scalar_to_hex(&c);
        let decoded = scalar_from_hex(&encoded).unwrap();
        assert_eq!(*c.as_ref(), decoded);
    }

    #[test]
    fn malformed_scalar_hex_is_rejected() {
        assert!(scalar_from_hex("not hex").is_err());
        assert!(scalar_from_hex("aabb").is_err());
    }
}
