use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use time::OffsetDateTime;

use crate::Error;

const ATTESTATION_DOMAIN: &[u8] = b"aster:noise-key-attestation:v1";

/// A statement, signed by a node identity, that the node speaks Noise with
/// the given static public key.
///
/// Peers cache this and dial the replay-safe surface without a prior TLS
/// round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAttestation {
    pub noise_public_key: [u8; 32],
    pub timestamp: OffsetDateTime,
    pub signer_public_key: [u8; 32],
    pub signature: Signature,
}

impl KeyAttestation {
    pub fn sign(signing_key: &SigningKey, noise_public_key: [u8; 32], timestamp: OffsetDateTime) -> Self {
        let message = attestation_message(&noise_public_key, timestamp);
        let signature = signing_key.sign(&message);

        Self {
            noise_public_key,
            timestamp,
            signer_public_key: signing_key.verifying_key().to_bytes(),
            signature,
        }
    }

    pub fn verify(&self) -> Result<(), Error> {
        let verifying_key = VerifyingKey::from_bytes(&self.signer_public_key).map_err(Error::BadAttestation)?;
        let message = attestation_message(&self.noise_public_key, self.timestamp);

        verifying_key
            .verify_strict(&message, &self.signature)
            .map_err(Error::BadAttestation)
    }
}

fn attestation_message(noise_public_key: &[u8; 32], timestamp: OffsetDateTime) -> Vec<u8> {
    let mut message = Vec::with_capacity(ATTESTATION_DOMAIN.len() + 32 + 8);
    message.extend_from_slice(ATTESTATION_DOMAIN);
    message.extend_from_slice(noise_public_key);
    message.extend_from_slice(&timestamp.unix_timestamp().to_be_bytes());
    message
}
