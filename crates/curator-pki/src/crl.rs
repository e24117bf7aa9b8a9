//! Certificate revocation lists of Managed CAs.
//!
//! A CRL only ever grows. Its CRL number is the entry count plus one, so it
//! increases with every revocation.

use curator_kv::Compare;
use curator_kv::CompareOp;
use curator_kv::EventKind;
use curator_kv::KeyValue;
use curator_kv::KeyValueStore;
use curator_kv::TxnOp;
use curator_kv::TxnRequest;
use curator_kv::WatchRequest;
use ed25519_dalek::SigningKey;
use futures::StreamExt;
use futures::stream::BoxStream;
use rcgen::CertificateRevocationListParams;
use rcgen::KeyIdMethod;
use rcgen::RevokedCertParams;
use rcgen::SerialNumber;
use snafu::OptionExt;
use snafu::ResultExt;
use time::OffsetDateTime;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::certificate::Certificate;
use crate::error::GenerateSnafu;
use crate::error::IssuerWithoutKeySnafu;
use crate::error::KeyspaceSnafu;
use crate::error::PkiError;
use crate::error::StoreSnafu;
use crate::keys::issuer_certificate;
use crate::keys::key_pair;
use crate::template::UNKNOWN_NOT_AFTER;
use crate::verify;

/// One revoked certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedEntry {
    /// Serial number as encoded in the certificate.
    pub serial: Vec<u8>,
    pub revoked_at: OffsetDateTime,
}

/// A parsed CRL together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crl {
    pub der: Vec<u8>,
    pub entries: Vec<RevokedEntry>,
    /// ModRevision of the CRL key. Zero if the CRL has not been written.
    pub mod_revision: u64,
}

impl Crl {
    pub fn parse(der: &[u8]) -> Result<Vec<RevokedEntry>, PkiError> {
        let (_, list) = x509_parser::parse_x509_crl(der).map_err(|e| PkiError::Parse {
            what: "CRL",
            reason: e.to_string(),
        })?;
        Ok(list
            .iter_revoked_certificates()
            .map(|revoked| RevokedEntry {
                serial: revoked.raw_serial().to_vec(),
                revoked_at: revoked.revocation_date.to_datetime(),
            })
            .collect())
    }

    fn from_kv(kv: &KeyValue) -> Result<Self, PkiError> {
        Ok(Self {
            entries: Self::parse(&kv.value)?,
            der: kv.value.clone(),
            mod_revision: kv.mod_revision,
        })
    }

    pub fn is_revoked(&self, serial: &[u8]) -> bool {
        self.entries.iter().any(|e| e.serial == serial)
    }

    /// The CRL number this list was (or will be) signed with.
    pub fn number(&self) -> u64 {
        self.entries.len() as u64 + 1
    }
}

fn make_crl(issuer_der: &[u8], key: &SigningKey, entries: &[RevokedEntry]) -> Result<Vec<u8>, PkiError> {
    let pair = key_pair(key)?;
    let issuer = issuer_certificate(issuer_der, &pair)?;
    let params = CertificateRevocationListParams {
        this_update: OffsetDateTime::now_utc(),
        next_update: UNKNOWN_NOT_AFTER,
        crl_number: SerialNumber::from(entries.len() as u64 + 1),
        issuing_distribution_point: None,
        revoked_certs: entries
            .iter()
            .map(|entry| RevokedCertParams {
                serial_number: SerialNumber::from_slice(&entry.serial),
                revocation_time: entry.revoked_at,
                reason_code: None,
                invalidity_date: None,
            })
            .collect(),
        key_identifier_method: KeyIdMethod::Sha256,
    };
    let crl = params.signed_by(&issuer, &pair).context(GenerateSnafu { what: "CRL" })?;
    Ok(crl.der().to_vec())
}

/// Emit an empty CRL for a freshly issued CA unless one exists.
/// Write an empty CRL for `ca` unless one exists.
pub(crate) async fn ensure_initial<S>(ca: &Certificate, store: &S, ca_der: &[u8], key: &SigningKey) -> Result<(), PkiError>
where S: KeyValueStore + ?Sized {
    let crl_key = ca.namespace().crl_key(ca.name()).context(KeyspaceSnafu)?;
    if store.get(&crl_key).await.context(StoreSnafu)?.is_some() {
        return Ok(());
    }
    let empty = make_crl(ca_der, key, &[])?;
    let response = store
        .txn(TxnRequest::new().when([Compare::absent(crl_key.as_str())]).then([TxnOp::put(crl_key.as_str(), empty)]))
        .await
        .context(StoreSnafu)?;
    if response.succeeded {
        debug!(ca = %ca.name(), "wrote empty CRL");
    }
    Ok(())
}

impl Certificate {
    fn check_managed_ca(&self) -> Result<(), PkiError> {
        if !self.is_managed_ca() {
            return Err(PkiError::NotManagedCa {
                name: self.name().to_string(),
            });
        }
        Ok(())
    }

    /// Current CRL of this CA, if one has been written.
    pub async fn crl<S>(&self, store: &S) -> Result<Option<Crl>, PkiError>
    where S: KeyValueStore + ?Sized {
        self.check_managed_ca()?;
        let crl_key = self.namespace().crl_key(self.name()).context(KeyspaceSnafu)?;
        match store.get(&crl_key).await.context(StoreSnafu)? {
            Some(kv) => Ok(Some(Crl::from_kv(&kv)?)),
            None => Ok(None),
        }
    }

    /// Revoke the most recently issued certificate carrying `hostname` as a DNS name.
    ///
    /// Revoking an already revoked certificate succeeds without change.
    pub async fn revoke<S>(&self, store: &S, hostname: &str) -> Result<(), PkiError>
    where S: KeyValueStore + ?Sized {
        self.check_managed_ca()?;
        let ca = self.ensure_keyed(store).await?;
        let key = ca.signing_key.as_ref().context(IssuerWithoutKeySnafu { name: self.name() })?;

        let crl_key = self.namespace().crl_key(self.name()).context(KeyspaceSnafu)?;
        let issued_range = self.namespace().issued_range().context(KeyspaceSnafu)?;
        let response = store
            .txn(TxnRequest::new().then([TxnOp::get(crl_key.as_str()), TxnOp::range(issued_range)]))
            .await
            .context(StoreSnafu)?;

        let (mut entries, mod_revision) = match response.kv(0) {
            Some(kv) => (Crl::parse(&kv.value)?, kv.mod_revision),
            None => (Vec::new(), 0),
        };

        let mut issued: Vec<&KeyValue> = response.kvs(1).iter().collect();
        issued.sort_by(|a, b| b.create_revision.cmp(&a.create_revision));
        let mut serial = None;
        for kv in issued {
            if verify::verify_signed_by(&kv.value, &ca.der).is_err() {
                continue;
            }
            if verify::dns_names(&kv.value)?.iter().any(|name| name == hostname) {
                serial = Some(verify::serial(&kv.value)?);
                break;
            }
        }
        let serial = serial.context(crate::error::HostnameNotFoundSnafu { hostname })?;

        if entries.iter().any(|e| e.serial == serial) {
            return Ok(());
        }
        entries.push(RevokedEntry {
            serial,
            revoked_at: OffsetDateTime::now_utc(),
        });
        let der = make_crl(&ca.der, key, &entries)?;

        let saved = store
            .txn(
                TxnRequest::new()
                    .when([Compare::mod_revision(crl_key.as_str(), CompareOp::Equal, mod_revision)])
                    .then([TxnOp::put(crl_key.as_str(), der)]),
            )
            .await
            .context(StoreSnafu)?;
        if !saved.succeeded {
            warn!(ca = %self.name(), hostname, "CRL changed concurrently");
            return Err(PkiError::CrlConflict);
        }
        info!(ca = %self.name(), hostname, entries = entries.len(), "revoked certificate");
        Ok(())
    }

    /// The current CRL followed by every later version.
    pub async fn watch_crl<S>(&self, store: &S) -> Result<BoxStream<'static, Result<Crl, PkiError>>, PkiError>
    where S: KeyValueStore + ?Sized {
        self.check_managed_ca()?;
        let crl_key = self.namespace().crl_key(self.name()).context(KeyspaceSnafu)?;
        let response = store.txn(TxnRequest::new().then([TxnOp::get(crl_key.as_str())])).await.context(StoreSnafu)?;
        let initial = response.kv(0).map(Crl::from_kv);

        let watch = store
            .watch(WatchRequest::key(crl_key).from_revision(response.revision + 1))
            .await
            .context(StoreSnafu)?;
        let updates = watch.flat_map(|item| {
            let crls: Vec<Result<Crl, PkiError>> = match item {
                Ok(response) => response
                    .events
                    .iter()
                    .filter(|event| event.kind == EventKind::Put)
                    .map(|event| Crl::from_kv(&event.kv))
                    .collect(),
                Err(source) => vec![Err(PkiError::Store { source })],
            };
            futures::stream::iter(crls)
        });
        Ok(futures::stream::iter(initial).chain(updates).boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use curator_kv::MemoryStore;

    use super::*;
    use crate::keys::generate_key;
    use crate::namespace::Namespace;
    use crate::template::Template;

    const NS: Namespace = Namespace::from_static("/crl-pki/");

    fn ca() -> Arc<Certificate> {
        Arc::new(Certificate::managed(NS, "ca", Template::ca("CRL CA")))
    }

    async fn issue_server(store: &MemoryStore, ca: &Arc<Certificate>, name: &str, host: &str) -> Vec<u8> {
        Certificate::external(
            NS,
            name,
            Template::server(vec![host.to_string()], Vec::new()),
            generate_key().verifying_key().to_bytes(),
        )
        .issued_by(ca.clone())
        .ensure(store)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn new_ca_has_empty_crl() {
        let store = MemoryStore::new();
        let crl = ca().crl(&*store).await.unwrap().unwrap();
        assert!(crl.entries.is_empty());
        assert_eq!(crl.number(), 1);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_monotonic() {
        let store = MemoryStore::new();
        let ca = ca();
        let a = issue_server(&store, &ca, "a", "a.example").await;
        let b = issue_server(&store, &ca, "b", "b.example").await;

        ca.revoke(&*store, "a.example").await.unwrap();
        let after_a = ca.crl(&*store).await.unwrap().unwrap();
        assert!(after_a.is_revoked(&verify::serial(&a).unwrap()));
        assert!(!after_a.is_revoked(&verify::serial(&b).unwrap()));

        ca.revoke(&*store, "a.example").await.unwrap();
        let again = ca.crl(&*store).await.unwrap().unwrap();
        assert_eq!(again.mod_revision, after_a.mod_revision);

        ca.revoke(&*store, "b.example").await.unwrap();
        let after_b = ca.crl(&*store).await.unwrap().unwrap();
        assert_eq!(after_b.entries.len(), 2);
        assert!(after_b.number() > after_a.number());
        assert_eq!(after_b.entries[0].serial, after_a.entries[0].serial);
    }

    #[tokio::test]
    async fn unknown_hostname_is_not_found() {
        let store = MemoryStore::new();
        let ca = ca();
        issue_server(&store, &ca, "a", "a.example").await;
        assert!(matches!(
            ca.revoke(&*store, "nope.example").await,
            Err(PkiError::HostnameNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn only_managed_cas_have_crls() {
        let store = MemoryStore::new();
        let leaf = Certificate::managed(NS, "leaf", Template::client("leaf", None)).issued_by(ca());
        assert!(matches!(leaf.revoke(&*store, "x").await, Err(PkiError::NotManagedCa { .. })));
    }

    #[tokio::test]
    async fn watch_delivers_new_versions() {
        let store = MemoryStore::new();
        let ca = ca();
        issue_server(&store, &ca, "a", "a.example").await;

        let mut watch = ca.watch_crl(&*store).await.unwrap();
        let initial = watch.next().await.unwrap().unwrap();
        assert!(initial.entries.is_empty());

        ca.revoke(&*store, "a.example").await.unwrap();
        let updated = watch.next().await.unwrap().unwrap();
        assert_eq!(updated.entries.len(), 1);
    }
}
