use anyhow::Context as _;
use ed25519_dalek::SigningKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Identity material of one satellite node: the TLS leaf it serves with and
/// the ed25519 key it signs attestations with.
///
/// Loading identities from disk is the front-end's business; the core only
/// consumes the assembled value.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    signing_key: SigningKey,
}

impl Identity {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        signing_key: SigningKey,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
            signing_key,
        }
    }

    /// Generates a fresh self-signed identity.
    pub fn generate(subject: &str) -> anyhow::Result<Self> {
        let key_pair = rcgen::KeyPair::generate().context("failed to generate TLS key pair")?;

        let params =
            rcgen::CertificateParams::new(vec![subject.to_owned()]).context("invalid certificate subject")?;
        let certificate = params
            .self_signed(&key_pair)
            .context("failed to self-sign certificate")?;

        let cert_chain = vec![certificate.der().clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = SigningKey::from_bytes(&rand::random());

        Ok(Self::new(cert_chain, private_key, signing_key))
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl core::fmt::Debug for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Identity")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("verifying_key", &self.signing_key.verifying_key())
            .finish_non_exhaustive()
    }
}
