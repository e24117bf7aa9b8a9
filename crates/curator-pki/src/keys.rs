//! ed25519 key handling for rcgen.

use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::Certificate as RcgenCertificate;
use rcgen::CertificateParams;
use rcgen::KeyPair;
use rcgen::PublicKeyData;
use rcgen::SignatureAlgorithm;
use snafu::ResultExt;

use crate::error::GenerateSnafu;
use crate::error::KeyEncodingSnafu;
use crate::error::PkiError;

/// An ed25519 public key without its private half, for External certificates.
pub(crate) struct RawPublicKey(pub [u8; 32]);

impl PublicKeyData for RawPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.0
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}

pub fn generate_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub(crate) fn key_pair(key: &SigningKey) -> Result<KeyPair, PkiError> {
    let der = key.to_pkcs8_der().context(KeyEncodingSnafu)?;
    KeyPair::try_from(der.as_bytes()).context(GenerateSnafu { what: "key pair" })
}

/// Rebuild an issuer handle from a stored CA certificate for signing.
pub(crate) fn issuer_certificate(der: &[u8], key: &KeyPair) -> Result<RcgenCertificate, PkiError> {
    let params = CertificateParams::from_ca_cert_der(&der.to_vec().into()).context(GenerateSnafu { what: "issuer" })?;
    params.self_signed(key).context(GenerateSnafu { what: "issuer" })
}

/// A random positive 16-byte serial number.
pub(crate) fn random_serial() -> [u8; 16] {
    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x40;
    serial
}
