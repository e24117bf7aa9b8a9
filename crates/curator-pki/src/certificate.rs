//! Certificates as promises: described up front, materialized by [`Certificate::ensure`].
//!
//! `ensure` is safe to call concurrently from any number of processes sharing
//! a store. Every write is guarded on the key not existing yet, and the loser
//! of a race adopts the winner's value.

use std::sync::Arc;

use curator_kv::Compare;
use curator_kv::KeyValueStore;
use curator_kv::TxnOp;
use curator_kv::TxnRequest;
use ed25519_dalek::SigningKey;
use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::OptionExt;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;

use crate::crl;
use crate::error::ConcurrentWriteSnafu;
use crate::error::GenerateSnafu;
use crate::error::IssuerWithoutKeySnafu;
use crate::error::KeyspaceSnafu;
use crate::error::PkiError;
use crate::error::StoreSnafu;
use crate::keys::RawPublicKey;
use crate::keys::generate_key;
use crate::keys::issuer_certificate;
use crate::keys::key_pair;
use crate::keys::random_serial;
use crate::namespace::Namespace;
use crate::template::Template;
use crate::verify;

/// How key material of a certificate is handled.
#[derive(Clone)]
pub enum CertificateMode {
    /// The private key is generated on first use and stored next to the certificate.
    Managed,
    /// The caller holds the private key; only the certificate is stored.
    External {
        /// Raw ed25519 public key.
        public_key: [u8; 32],
    },
    /// Nothing is stored. A fresh key is generated unless one is given.
    Ephemeral {
        /// Key to certify, if any.
        key: Option<SigningKey>,
    },
}

impl CertificateMode {
    fn label(&self) -> &'static str {
        match self {
            CertificateMode::Managed => "managed",
            CertificateMode::External { .. } => "external",
            CertificateMode::Ephemeral { .. } => "ephemeral",
        }
    }
}

/// Who signs a certificate.
#[derive(Clone)]
pub enum Issuer {
    SelfSigned,
    Certificate(Arc<Certificate>),
}

/// A certificate that will be issued on demand.
#[derive(Clone)]
pub struct Certificate {
    namespace: Namespace,
    name: String,
    issuer: Issuer,
    template: Template,
    mode: CertificateMode,
}

/// The materialized result of [`Certificate::ensure_keyed`].
#[derive(Clone)]
pub struct IssuedCertificate {
    pub der: Vec<u8>,
    pub public_key: [u8; 32],
    /// Present for Managed and Ephemeral certificates.
    pub signing_key: Option<SigningKey>,
}

impl Certificate {
    /// A self-signed Managed certificate. Use [`Certificate::issued_by`] to change the issuer.
    pub fn managed(namespace: Namespace, name: impl Into<String>, template: Template) -> Self {
        Self {
            namespace,
            name: name.into(),
            issuer: Issuer::SelfSigned,
            template,
            mode: CertificateMode::Managed,
        }
    }

    pub fn external(namespace: Namespace, name: impl Into<String>, template: Template, public_key: [u8; 32]) -> Self {
        Self {
            namespace,
            name: name.into(),
            issuer: Issuer::SelfSigned,
            template,
            mode: CertificateMode::External { public_key },
        }
    }

    pub fn ephemeral(namespace: Namespace, template: Template, key: Option<SigningKey>) -> Self {
        Self {
            namespace,
            name: String::new(),
            issuer: Issuer::SelfSigned,
            template,
            mode: CertificateMode::Ephemeral { key },
        }
    }

    pub fn issued_by(mut self, issuer: Arc<Certificate>) -> Self {
        self.issuer = Issuer::Certificate(issuer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn mode(&self) -> &CertificateMode {
        &self.mode
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub(crate) fn is_managed_ca(&self) -> bool {
        matches!(self.mode, CertificateMode::Managed) && matches!(self.issuer, Issuer::SelfSigned) && self.template.is_ca
    }

    /// Return the DER certificate, issuing and persisting it if needed.
    pub async fn ensure<S>(&self, store: &S) -> Result<Vec<u8>, PkiError>
    where S: KeyValueStore + ?Sized {
        Ok(self.ensure_keyed(store).await?.der)
    }

    /// Like [`Certificate::ensure`], also returning key material.
    pub fn ensure_keyed<'a, S>(&'a self, store: &'a S) -> BoxFuture<'a, Result<IssuedCertificate, PkiError>>
    where S: KeyValueStore + ?Sized {
        async move {
            let (public_key, signing_key) = match &self.mode {
                CertificateMode::Ephemeral { key } => {
                    let key = key.clone().unwrap_or_else(generate_key);
                    let public_key = key.verifying_key().to_bytes();
                    let der = self.issue(store, &public_key, Some(&key)).await?;
                    return Ok(IssuedCertificate {
                        der,
                        public_key,
                        signing_key: Some(key),
                    });
                }
                CertificateMode::Managed => {
                    self.check_name()?;
                    let key = self.ensure_private_key(store).await?;
                    (key.verifying_key().to_bytes(), Some(key))
                }
                CertificateMode::External { public_key } => {
                    self.check_name()?;
                    (*public_key, None)
                }
            };

            let cert_key = self.namespace.certificate_key(&self.name).context(KeyspaceSnafu)?;
            let der = match store.get(&cert_key).await.context(StoreSnafu)? {
                Some(kv) => {
                    self.check_stored_key(&kv.value, &public_key)?;
                    kv.value
                }
                None => self.store_issued(store, &cert_key, &public_key, signing_key.as_ref()).await?,
            };

            // A managed CA always has a CRL, even if the process that issued
            // it stopped before writing one.
            if self.is_managed_ca() {
                if let Some(key) = &signing_key {
                    crl::ensure_initial(self, store, &der, key).await?;
                }
            }

            Ok(IssuedCertificate {
                der,
                public_key,
                signing_key,
            })
        }
        .boxed()
    }

    /// Issue and store under a create guard. The loser of a race adopts the stored certificate.
    async fn store_issued<S>(
        &self,
        store: &S,
        cert_key: &str,
        public_key: &[u8; 32],
        signing_key: Option<&SigningKey>,
    ) -> Result<Vec<u8>, PkiError>
    where S: KeyValueStore + ?Sized {
        let issued = self.issue(store, public_key, signing_key).await?;
        let response = store
            .txn(
                TxnRequest::new()
                    .when([Compare::absent(cert_key)])
                    .then([TxnOp::put(cert_key, issued.clone())])
                    .or_else([TxnOp::get(cert_key)]),
            )
            .await
            .context(StoreSnafu)?;
        if response.succeeded {
            info!(namespace = %self.namespace.prefix(), name = %self.name, mode = self.mode.label(), "issued certificate");
            return Ok(issued);
        }
        let winner = response.kv(0).context(ConcurrentWriteSnafu { key: cert_key })?;
        debug!(name = %self.name, "lost certificate issuance race, using stored certificate");
        self.check_stored_key(&winner.value, public_key)?;
        Ok(winner.value.clone())
    }

    fn check_name(&self) -> Result<(), PkiError> {
        if self.name.is_empty() {
            return Err(PkiError::EmptyName {
                mode: self.mode.label(),
            });
        }
        Ok(())
    }

    fn check_stored_key(&self, der: &[u8], public_key: &[u8; 32]) -> Result<(), PkiError> {
        if &verify::public_key(der)? != public_key {
            return Err(PkiError::PublicKeyMismatch {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Load the stored seed, or create one under a create guard.
    async fn ensure_private_key<S>(&self, store: &S) -> Result<SigningKey, PkiError>
    where S: KeyValueStore + ?Sized {
        let key_path = self.namespace.private_key_key(&self.name).context(KeyspaceSnafu)?;
        if let Some(kv) = store.get(&key_path).await.context(StoreSnafu)? {
            return decode_seed(&key_path, &kv.value);
        }

        let key = generate_key();
        let response = store
            .txn(
                TxnRequest::new()
                    .when([Compare::absent(key_path.as_str())])
                    .then([TxnOp::put(key_path.as_str(), key.to_bytes().to_vec())])
                    .or_else([TxnOp::get(key_path.as_str())]),
            )
            .await
            .context(StoreSnafu)?;
        if response.succeeded {
            debug!(name = %self.name, "generated private key");
            return Ok(key);
        }
        let winner = response.kv(0).context(ConcurrentWriteSnafu { key: key_path.as_str() })?;
        decode_seed(&key_path, &winner.value)
    }

    async fn issue<S>(&self, store: &S, public_key: &[u8; 32], own_key: Option<&SigningKey>) -> Result<Vec<u8>, PkiError>
    where S: KeyValueStore + ?Sized {
        let serial = random_serial();
        match &self.issuer {
            Issuer::SelfSigned => {
                let key = own_key.context(IssuerWithoutKeySnafu { name: self.name.as_str() })?;
                let params = self.template.to_params(&serial, true).context(GenerateSnafu { what: "certificate" })?;
                let pair = key_pair(key)?;
                let cert = params.self_signed(&pair).context(GenerateSnafu { what: "certificate" })?;
                Ok(cert.der().to_vec())
            }
            Issuer::Certificate(parent) => {
                let parent_issued = parent.ensure_keyed(store).await?;
                let parent_key = parent_issued
                    .signing_key
                    .as_ref()
                    .context(IssuerWithoutKeySnafu { name: parent.name.as_str() })?;
                let params = self.template.to_params(&serial, false).context(GenerateSnafu { what: "certificate" })?;
                let issuer_pair = key_pair(parent_key)?;
                let issuer = issuer_certificate(&parent_issued.der, &issuer_pair)?;
                let cert = params
                    .signed_by(&RawPublicKey(*public_key), &issuer, &issuer_pair)
                    .context(GenerateSnafu { what: "certificate" })?;
                Ok(cert.der().to_vec())
            }
        }
    }
}

fn decode_seed(key_path: &str, bytes: &[u8]) -> Result<SigningKey, PkiError> {
    let seed: [u8; 32] = bytes.try_into().map_err(|_| PkiError::InvalidStoredKey {
        key: key_path.to_string(),
        len: bytes.len(),
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

#[cfg(test)]
mod tests {
    use curator_kv::MemoryStore;

    use super::*;
    use crate::template::ExtendedKeyUsage;

    const NS: Namespace = Namespace::from_static("/test-pki/");

    fn ca() -> Arc<Certificate> {
        Arc::new(Certificate::managed(NS, "ca", Template::ca("Test CA")))
    }

    #[tokio::test]
    async fn managed_ca_is_stable() {
        let store = MemoryStore::new();
        let first = ca().ensure(&*store).await.unwrap();
        let second = ca().ensure(&*store).await.unwrap();
        assert_eq!(first, second);
        assert!(verify::is_ca(&first).unwrap());
        assert!(store.get("/test-pki/keys/ca-privkey.bin").await.unwrap().is_some());
        assert!(store.get("/test-pki/ca-crl.der").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn external_certificate_is_signed_by_ca() {
        let store = MemoryStore::new();
        let ca = ca();
        let node_key = generate_key();
        let cert = Certificate::external(
            NS,
            "node",
            Template::server(vec!["node-1".into()], Vec::new()).with_extended_key_usage(ExtendedKeyUsage::ClientAuth),
            node_key.verifying_key().to_bytes(),
        )
        .issued_by(ca.clone());

        let der = cert.ensure(&*store).await.unwrap();
        let ca_der = ca.ensure(&*store).await.unwrap();
        verify::verify_signed_by(&der, &ca_der).unwrap();
        assert_eq!(verify::public_key(&der).unwrap(), node_key.verifying_key().to_bytes());
        assert_eq!(verify::dns_names(&der).unwrap(), vec!["node-1".to_string()]);
        assert!(store.get("/test-pki/keys/node-privkey.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn external_key_change_is_rejected() {
        let store = MemoryStore::new();
        let template = Template::client("owner", None);
        let first = Certificate::external(NS, "owner", template.clone(), generate_key().verifying_key().to_bytes())
            .issued_by(ca());
        first.ensure(&*store).await.unwrap();

        let second =
            Certificate::external(NS, "owner", template, generate_key().verifying_key().to_bytes()).issued_by(ca());
        assert!(matches!(second.ensure(&*store).await, Err(PkiError::PublicKeyMismatch { .. })));
    }

    #[tokio::test]
    async fn ca_bit_cleared_for_issued_ca_template() {
        let store = MemoryStore::new();
        let child = Certificate::managed(NS, "child", Template::ca("child")).issued_by(ca());
        let der = child.ensure(&*store).await.unwrap();
        assert!(!verify::is_ca(&der).unwrap());
    }

    #[tokio::test]
    async fn ephemeral_touches_nothing() {
        let store = MemoryStore::new();
        let key = generate_key();
        let cert = Certificate::ephemeral(NS, Template::client("tmp", None), Some(key.clone()));
        let issued = cert.ensure_keyed(&*store).await.unwrap();
        assert_eq!(issued.public_key, key.verifying_key().to_bytes());
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn unnamed_persistent_certificates_fail() {
        let store = MemoryStore::new();
        let managed = Certificate::managed(NS, "", Template::ca("x"));
        assert!(matches!(managed.ensure(&*store).await, Err(PkiError::EmptyName { mode: "managed" })));
        let external = Certificate::external(NS, "", Template::client("x", None), [7; 32]);
        assert!(matches!(external.ensure(&*store).await, Err(PkiError::EmptyName { mode: "external" })));
    }

    #[tokio::test]
    async fn external_self_signed_has_no_key() {
        let store = MemoryStore::new();
        let cert = Certificate::external(NS, "selfish", Template::client("x", None), [7; 32]);
        assert!(matches!(cert.ensure(&*store).await, Err(PkiError::IssuerWithoutKey { .. })));
    }

    #[tokio::test]
    async fn managed_ca_recreates_missing_crl() {
        let store = MemoryStore::new();
        let ca = ca();
        let der = ca.ensure(&*store).await.unwrap();
        store.txn(TxnRequest::new().then([TxnOp::delete("/test-pki/ca-crl.der")])).await.unwrap();
        assert!(ca.crl(&*store).await.unwrap().is_none());

        assert_eq!(ca.ensure(&*store).await.unwrap(), der);
        let crl = ca.crl(&*store).await.unwrap().unwrap();
        assert!(crl.entries.is_empty());

        let written_at = crl.mod_revision;
        ca.ensure(&*store).await.unwrap();
        assert_eq!(ca.crl(&*store).await.unwrap().unwrap().mod_revision, written_at);
    }
}
