pub mod error;
pub mod identity;
pub mod ratchet;
pub mod schnorr;

pub use error::CryptoError;
pub use identity::{digest_key, Identity};
pub use ratchet::{RatchetAccount, RatchetSession};
