//! Inspection of DER certificates.

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::error::PkiError;

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, PkiError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| PkiError::Parse {
        what: "certificate",
        reason: e.to_string(),
    })?;
    Ok(cert)
}

/// The raw ed25519 public key a certificate was issued for.
pub fn public_key(der: &[u8]) -> Result<[u8; 32], PkiError> {
    let cert = parse(der)?;
    let data: &[u8] = &cert.public_key().subject_public_key.data;
    <[u8; 32]>::try_from(data).map_err(|_| PkiError::InvalidPublicKey { len: data.len() })
}

/// DNS subject alternative names.
pub fn dns_names(der: &[u8]) -> Result<Vec<String>, PkiError> {
    let cert = parse(der)?;
    let san = cert.subject_alternative_name().map_err(|e| PkiError::Parse {
        what: "subject alternative names",
        reason: e.to_string(),
    })?;
    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// The serial number as encoded in the certificate.
pub fn serial(der: &[u8]) -> Result<Vec<u8>, PkiError> {
    Ok(parse(der)?.raw_serial().to_vec())
}

/// Check that `der` carries a valid signature by the key of `issuer_der`.
pub fn verify_signed_by(der: &[u8], issuer_der: &[u8]) -> Result<(), PkiError> {
    let cert = parse(der)?;
    let issuer = parse(issuer_der)?;
    if cert.issuer().as_raw() != issuer.subject().as_raw() {
        return Err(PkiError::Verify {
            reason: "issuer name does not match".to_string(),
        });
    }
    cert.verify_signature(Some(issuer.public_key())).map_err(|e| PkiError::Verify { reason: e.to_string() })
}

/// Whether the certificate has the CA basic constraint set.
pub fn is_ca(der: &[u8]) -> Result<bool, PkiError> {
    Ok(parse(der)?.is_ca())
}
