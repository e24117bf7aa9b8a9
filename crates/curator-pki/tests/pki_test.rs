//! End-to-end certificate issuance against a shared store.

use std::sync::Arc;

use curator_kv::MemoryStore;
use curator_pki::Certificate;
use curator_pki::ExtendedKeyUsage;
use curator_pki::Namespace;
use curator_pki::PkiError;
use curator_pki::Template;
use curator_pki::generate_key;
use curator_pki::verify;

const CLUSTER: Namespace = Namespace::from_static("/cluster-pki/");

fn cluster_ca() -> Arc<Certificate> {
    Arc::new(Certificate::managed(CLUSTER, "ca", Template::ca("Cluster CA")))
}

#[tokio::test]
async fn concurrent_ensure_converges_on_one_certificate() {
    let store = MemoryStore::new();
    let node_key = generate_key().verifying_key().to_bytes();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let cert = Certificate::external(
                CLUSTER,
                "node-1",
                Template::server(vec!["node-1".into()], Vec::new()).with_extended_key_usage(ExtendedKeyUsage::ClientAuth),
                node_key,
            )
            .issued_by(cluster_ca());
            cert.ensure(&*store).await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));

    let ca = cluster_ca().ensure(&*store).await.unwrap();
    verify::verify_signed_by(&results[0], &ca).unwrap();
}

#[tokio::test]
async fn issued_certificates_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pki.redb");

    let (ca_before, leaf_before) = {
        let store = MemoryStore::open(&path).unwrap();
        let ca = cluster_ca();
        let leaf = Certificate::managed(CLUSTER, "internal", Template::client("internal", Some("system")))
            .issued_by(ca.clone());
        (ca.ensure(&*store).await.unwrap(), leaf.ensure(&*store).await.unwrap())
    };

    let store = MemoryStore::open(&path).unwrap();
    let ca = cluster_ca();
    assert_eq!(ca.ensure(&*store).await.unwrap(), ca_before);
    let leaf = Certificate::managed(CLUSTER, "internal", Template::client("internal", Some("system"))).issued_by(ca);
    assert_eq!(leaf.ensure(&*store).await.unwrap(), leaf_before);
}

#[tokio::test]
async fn revocation_targets_latest_certificate_for_host() {
    let store = MemoryStore::new();
    let ca = cluster_ca();
    let old = Certificate::external(
        CLUSTER,
        "old",
        Template::server(vec!["host".into()], Vec::new()),
        generate_key().verifying_key().to_bytes(),
    )
    .issued_by(ca.clone())
    .ensure(&*store)
    .await
    .unwrap();
    let new = Certificate::external(
        CLUSTER,
        "new",
        Template::server(vec!["host".into()], Vec::new()),
        generate_key().verifying_key().to_bytes(),
    )
    .issued_by(ca.clone())
    .ensure(&*store)
    .await
    .unwrap();

    ca.revoke(&*store, "host").await.unwrap();
    let crl = ca.crl(&*store).await.unwrap().unwrap();
    assert!(crl.is_revoked(&verify::serial(&new).unwrap()));
    assert!(!crl.is_revoked(&verify::serial(&old).unwrap()));
}

#[tokio::test]
async fn certificate_from_another_ca_is_not_revocable() {
    let store = MemoryStore::new();
    let other = Arc::new(Certificate::managed(CLUSTER, "other-ca", Template::ca("Other CA")));
    Certificate::external(
        CLUSTER,
        "foreign",
        Template::server(vec!["foreign".into()], Vec::new()),
        generate_key().verifying_key().to_bytes(),
    )
    .issued_by(other)
    .ensure(&*store)
    .await
    .unwrap();

    let result = cluster_ca().revoke(&*store, "foreign").await;
    assert!(matches!(result, Err(PkiError::HostnameNotFound { .. })));
}

fn node_certificate(public_key: [u8; 32]) -> Certificate {
    Certificate::external(
        CLUSTER,
        "node-2",
        Template::server(vec!["node-2".into()], Vec::new()).with_extended_key_usage(ExtendedKeyUsage::ClientAuth),
        public_key,
    )
    .issued_by(cluster_ca())
}

#[tokio::test]
async fn external_ensure_with_same_key_returns_stored_bytes() {
    let store = MemoryStore::new();
    let node_key = generate_key().verifying_key().to_bytes();

    let first = node_certificate(node_key).ensure(&*store).await.unwrap();
    let revision = store.revision();
    let second = node_certificate(node_key).ensure(&*store).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.revision(), revision);
    assert_eq!(verify::public_key(&second).unwrap(), node_key);
}

#[tokio::test]
async fn external_ensure_with_different_key_fails() {
    let store = MemoryStore::new();
    let original = node_certificate(generate_key().verifying_key().to_bytes()).ensure(&*store).await.unwrap();

    let result = node_certificate(generate_key().verifying_key().to_bytes()).ensure(&*store).await;
    assert!(matches!(result, Err(PkiError::PublicKeyMismatch { .. })));
    let stored = node_certificate(verify::public_key(&original).unwrap()).ensure(&*store).await.unwrap();
    assert_eq!(stored, original);
}
