//! Certificate families issued by the curator.
//!
//! - `/cluster-pki/`: the cluster identity CA, node certificates and the owner.
//! - `/consensus-pki/`: the consensus CA and peer certificates.
//! - `/kube-pki/`: the workload identity CA and Kubernetes worker certificates.

use std::net::IpAddr;
use std::sync::Arc;

use curator_pki::Certificate;
use curator_pki::ExtendedKeyUsage;
use curator_pki::Namespace;
use curator_pki::Template;

use crate::identity::OWNER_IDENTITY;
use crate::identity::node_certificate_template;
use crate::identity::node_id;

pub const CLUSTER_PKI: Namespace = Namespace::from_static("/cluster-pki/");
pub const CONSENSUS_PKI: Namespace = Namespace::from_static("/consensus-pki/");
pub const KUBE_PKI: Namespace = Namespace::from_static("/kube-pki/");

/// The certificate authorities of one cluster and the leaf certificates they issue.
pub struct PkiContext {
    cluster_ca: Arc<Certificate>,
    consensus_ca: Arc<Certificate>,
    kube_ca: Arc<Certificate>,
}

impl Default for PkiContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PkiContext {
    pub fn new() -> Self {
        Self {
            cluster_ca: Arc::new(Certificate::managed(CLUSTER_PKI, "ca", Template::ca("Curator Cluster CA"))),
            consensus_ca: Arc::new(Certificate::managed(CONSENSUS_PKI, "ca", Template::ca("Curator Consensus CA"))),
            kube_ca: Arc::new(Certificate::managed(KUBE_PKI, "id-ca", Template::ca("Curator Workload Identity CA"))),
        }
    }

    pub fn cluster_ca(&self) -> &Arc<Certificate> {
        &self.cluster_ca
    }

    pub fn consensus_ca(&self) -> &Arc<Certificate> {
        &self.consensus_ca
    }

    pub fn kube_ca(&self) -> &Arc<Certificate> {
        &self.kube_ca
    }

    /// A node's identity certificate, named after its ID.
    pub fn node_certificate(&self, public_key: [u8; 32]) -> Certificate {
        let id = node_id(&public_key);
        Certificate::external(CLUSTER_PKI, id.clone(), node_certificate_template(&id), public_key)
            .issued_by(self.cluster_ca.clone())
    }

    /// The owner's client certificate.
    pub fn owner_certificate(&self, public_key: [u8; 32]) -> Certificate {
        Certificate::external(CLUSTER_PKI, OWNER_IDENTITY, Template::client(OWNER_IDENTITY, None), public_key)
            .issued_by(self.cluster_ca.clone())
    }

    /// Peer certificate of a consensus member, valid for its ID and external address.
    pub fn consensus_peer_certificate(
        &self,
        id: &str,
        public_key: [u8; 32],
        external_address: Option<IpAddr>,
    ) -> Certificate {
        let template = Template::server(vec![id.to_string()], external_address.into_iter().collect())
            .with_extended_key_usage(ExtendedKeyUsage::ClientAuth);
        Certificate::external(CONSENSUS_PKI, id, template, public_key).issued_by(self.consensus_ca.clone())
    }

    pub fn kubelet_server(&self, id: &str, public_key: [u8; 32]) -> Certificate {
        let template = Template::server(vec![format!("system:node:{id}")], Vec::new());
        self.kube_leaf(format!("kubelet-{id}-server"), template, public_key)
    }

    pub fn kubelet_client(&self, id: &str, public_key: [u8; 32]) -> Certificate {
        let template = Template::client(format!("system:node:{id}"), Some("system:nodes"));
        self.kube_leaf(format!("kubelet-{id}-client"), template, public_key)
    }

    pub fn csi_provisioner(&self, id: &str, public_key: [u8; 32]) -> Certificate {
        let template = Template::client(format!("csi-provisioner:{id}"), Some("csi-provisioner"));
        self.kube_leaf(format!("csi-provisioner-{id}"), template, public_key)
    }

    pub fn netservices(&self, id: &str, public_key: [u8; 32]) -> Certificate {
        let template = Template::client(format!("netservices:{id}"), Some("netservices"));
        self.kube_leaf(format!("netservices-{id}"), template, public_key)
    }

    fn kube_leaf(&self, name: String, template: Template, public_key: [u8; 32]) -> Certificate {
        Certificate::external(KUBE_PKI, name, template, public_key).issued_by(self.kube_ca.clone())
    }
}

#[cfg(test)]
mod tests {
    use curator_kv::MemoryStore;
    use curator_pki::generate_key;
    use curator_pki::verify;

    use super::*;

    #[tokio::test]
    async fn node_certificate_chains_to_cluster_ca() {
        let store = MemoryStore::new();
        let pki = PkiContext::new();
        let key = generate_key().verifying_key().to_bytes();

        let ca = pki.cluster_ca().ensure(&*store).await.unwrap();
        let cert = pki.node_certificate(key).ensure(&*store).await.unwrap();
        verify::verify_signed_by(&cert, &ca).unwrap();
        assert_eq!(verify::dns_names(&cert).unwrap(), vec![node_id(&key)]);
        assert_eq!(verify::public_key(&cert).unwrap(), key);
    }

    #[tokio::test]
    async fn kubernetes_certificates_use_workload_ca() {
        let store = MemoryStore::new();
        let pki = PkiContext::new();
        let key = generate_key().verifying_key().to_bytes();

        let ca = pki.kube_ca().ensure(&*store).await.unwrap();
        let server = pki.kubelet_server("node-01", key).ensure(&*store).await.unwrap();
        verify::verify_signed_by(&server, &ca).unwrap();
        assert_eq!(verify::dns_names(&server).unwrap(), vec!["system:node:node-01".to_string()]);

        let cluster_ca = pki.cluster_ca().ensure(&*store).await.unwrap();
        assert!(verify::verify_signed_by(&server, &cluster_ca).is_err());
    }
}
