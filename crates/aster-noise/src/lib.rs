//! Noise session layer for the replay-safe public endpoint surface.
//!
//! Sessions use the IK pattern: the initiator must already know the
//! responder's static key, which it learns out-of-band from a signed
//! [`KeyAttestation`]. Transport messages are framed with a 2-byte
//! big-endian length.

mod attestation;
mod stream;

pub use self::attestation::KeyAttestation;
pub use self::stream::NoiseStream;

use sha2::{Digest as _, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Noise protocol parameters for every satellite session.
pub const PROTOCOL: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2b";

const KEY_DERIVATION_DOMAIN: &[u8] = b"aster:noise-static-key:v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("noise protocol failure")]
    Protocol(#[from] snow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("noise message of {size} bytes exceeds the protocol maximum")]
    MessageTooLarge { size: usize },

    #[error("key attestation signature does not verify")]
    BadAttestation(#[source] ed25519_dalek::SignatureError),
}

/// Static-key material for one side of a Noise session.
#[derive(Clone)]
pub struct Config {
    secret: StaticSecret,
    public: PublicKey,
}

impl Config {
    pub fn from_static_secret(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Deterministically derives the static key from an identity seed, so
    /// the attested key survives process restarts.
    pub fn derive_from_seed(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_DOMAIN);
        hasher.update(seed);
        Self::from_static_secret(hasher.finalize().into())
    }

    pub fn generate() -> Self {
        Self::from_static_secret(rand::random())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub(crate) fn responder(&self) -> Result<snow::HandshakeState, Error> {
        let secret = self.secret.to_bytes();
        let params = PROTOCOL.parse().map_err(Error::Protocol)?;

        Ok(snow::Builder::new(params).local_private_key(&secret).build_responder()?)
    }

    pub(crate) fn initiator(&self, remote_public_key: &[u8; 32]) -> Result<snow::HandshakeState, Error> {
        let secret = self.secret.to_bytes();
        let params = PROTOCOL.parse().map_err(Error::Protocol)?;

        Ok(snow::Builder::new(params)
            .local_private_key(&secret)
            .remote_public_key(remote_public_key)
            .build_initiator()?)
    }
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = Config::derive_from_seed(b"identity seed");
        let b = Config::derive_from_seed(b"identity seed");
        let c = Config::derive_from_seed(b"another seed");

        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }
}
