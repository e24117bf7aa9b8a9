//! The curator RPC surface.
//!
//! [`CuratorService`] is implemented by the leader, by followers and by the
//! dispatcher that routes between them. Requests and responses are plain
//! serde types; binary fields travel as base64.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;

use crate::authz::Peer;
use crate::codec;
use crate::error::CuratorError;
use crate::labels::Label;
use crate::state::ClusterConfiguration;
use crate::state::ClusterConfigurationPatch;
use crate::state::ClusterNetworking;
use crate::state::NodeRoles;
use crate::state::NodeState;
use crate::state::NodeStatus;
use crate::state::StorageSecurity;
use crate::state::TpmUsage;

// Node watch

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WatchKind {
    Node { id: String },
    AllNodes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub kind: WatchKind,
}

/// A node as seen by watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedNode {
    pub id: String,
    #[serde(with = "codec::hex_key")]
    pub public_key: [u8; 32],
    pub state: NodeState,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub roles: NodeRoles,
    #[serde(default)]
    pub cluster_networking: Option<ClusterNetworking>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// All nodes that existed when the watch started have been sent.
    LastBacklogSent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(default)]
    pub nodes: Vec<WatchedNode>,
    /// IDs of deleted nodes.
    #[serde(default)]
    pub tombstones: Vec<String>,
    #[serde(default)]
    pub progress: Option<Progress>,
}

pub type NodeWatchStream = BoxStream<'static, Result<WatchEvent, CuratorError>>;

// Certificates for Kubernetes workers

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesWorkerKeys {
    #[serde(with = "codec::base64_bytes")]
    pub kubelet_pubkey: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub csi_provisioner_pubkey: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub netservices_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IssueCertificateRequest {
    KubernetesWorker(KubernetesWorkerKeys),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesWorkerCertificates {
    #[serde(with = "codec::base64_bytes")]
    pub identity_ca_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub kubelet_server_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub kubelet_client_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub csi_provisioner_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub netservices_certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IssueCertificateResponse {
    KubernetesWorker(KubernetesWorkerCertificates),
}

// Node self-service

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeStatusRequest {
    pub node_id: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeClusterNetworkingRequest {
    /// Base64 WireGuard public key.
    pub wireguard_pubkey: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCurrentLeaderResponse {
    pub leader_node_id: String,
    /// External address of the leader, empty if it never reported one.
    pub leader_host: String,
    pub leader_port: u16,
    pub this_node_id: String,
}

// Registration

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    #[serde(with = "codec::base64_bytes")]
    pub register_ticket: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub join_key: Vec<u8>,
    #[serde(default)]
    pub have_local_tpm: bool,
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub cluster_configuration: ClusterConfiguration,
    pub tpm_usage: TpmUsage,
    pub recommended_storage_security: StorageSecurity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNodeRequest {
    pub storage_security: StorageSecurity,
    #[serde(with = "codec::base64_bytes", default)]
    pub cluster_unlock_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNodeResponse {
    #[serde(with = "codec::base64_bytes")]
    pub ca_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub node_certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinNodeRequest {
    #[serde(default)]
    pub using_sealed_configuration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinNodeResponse {
    #[serde(with = "codec::base64_bytes")]
    pub cluster_unlock_key: Vec<u8>,
}

// Management

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRegisterTicketResponse {
    #[serde(with = "codec::base64_bytes")]
    pub ticket: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    #[serde(with = "codec::hex_key")]
    pub public_key: [u8; 32],
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetClusterInfoResponse {
    pub cluster_directory: Vec<DirectoryNode>,
    #[serde(with = "codec::base64_bytes")]
    pub ca_certificate: Vec<u8>,
    pub cluster_configuration: ClusterConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodesRequest {
    /// Only return nodes in this state.
    #[serde(default)]
    pub state: Option<NodeState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    #[serde(with = "codec::hex_key")]
    pub public_key: [u8; 32],
    pub state: NodeState,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    pub tpm_usage: TpmUsage,
    pub roles: NodeRoles,
    /// Sorted by key.
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodesResponse {
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveNodeRequest {
    #[serde(with = "codec::base64_bytes")]
    pub public_key: Vec<u8>,
}

/// Picks one node for a management call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelector {
    Id(String),
    PublicKey(#[serde(with = "codec::base64_bytes")] Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeRolesRequest {
    pub node: NodeSelector,
    #[serde(default)]
    pub consensus_member: Option<bool>,
    #[serde(default)]
    pub kubernetes_controller: Option<bool>,
    #[serde(default)]
    pub kubernetes_worker: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeLabelsRequest {
    pub node: NodeSelector,
    #[serde(default)]
    pub upserts: Vec<Label>,
    #[serde(default)]
    pub deletes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNodeRequest {
    pub node: NodeSelector,
    #[serde(default)]
    pub bypass_roles: bool,
    #[serde(default)]
    pub bypass_decommissioned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureClusterRequest {
    /// Expected current values of the masked fields.
    #[serde(default)]
    pub base_config: Option<ClusterConfigurationPatch>,
    #[serde(default)]
    pub new_config: Option<ClusterConfigurationPatch>,
    /// Dotted field paths to change.
    #[serde(default)]
    pub update_mask: Option<Vec<String>>,
}

// Owner escrow

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRequest {
    pub requested_identity: String,
    #[serde(with = "codec::base64_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowResponse {
    #[serde(with = "codec::base64_bytes")]
    pub owner_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub ca_certificate: Vec<u8>,
}

/// Sorted labels of a node.
pub fn labels_to_vec(labels: &BTreeMap<String, String>) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Operations served by a curator.
#[async_trait]
pub trait CuratorService: Send + Sync {
    async fn watch(&self, peer: Peer, request: WatchRequest) -> Result<NodeWatchStream, CuratorError>;

    async fn issue_certificate(
        &self,
        peer: Peer,
        request: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CuratorError>;

    async fn update_node_status(&self, peer: Peer, request: UpdateNodeStatusRequest) -> Result<(), CuratorError>;

    async fn update_node_cluster_networking(
        &self,
        peer: Peer,
        request: UpdateNodeClusterNetworkingRequest,
    ) -> Result<(), CuratorError>;

    async fn get_current_leader(&self, peer: Peer) -> Result<GetCurrentLeaderResponse, CuratorError>;

    async fn register_node(&self, peer: Peer, request: RegisterNodeRequest) -> Result<RegisterNodeResponse, CuratorError>;

    async fn commit_node(&self, peer: Peer, request: CommitNodeRequest) -> Result<CommitNodeResponse, CuratorError>;

    async fn join_node(&self, peer: Peer, request: JoinNodeRequest) -> Result<JoinNodeResponse, CuratorError>;

    async fn get_register_ticket(&self, peer: Peer) -> Result<GetRegisterTicketResponse, CuratorError>;

    async fn get_cluster_info(&self, peer: Peer) -> Result<GetClusterInfoResponse, CuratorError>;

    async fn get_nodes(&self, peer: Peer, request: GetNodesRequest) -> Result<GetNodesResponse, CuratorError>;

    async fn approve_node(&self, peer: Peer, request: ApproveNodeRequest) -> Result<(), CuratorError>;

    async fn update_node_roles(&self, peer: Peer, request: UpdateNodeRolesRequest) -> Result<(), CuratorError>;

    async fn update_node_labels(&self, peer: Peer, request: UpdateNodeLabelsRequest) -> Result<(), CuratorError>;

    async fn delete_node(&self, peer: Peer, request: DeleteNodeRequest) -> Result<(), CuratorError>;

    async fn configure_cluster(
        &self,
        peer: Peer,
        request: ConfigureClusterRequest,
    ) -> Result<ClusterConfiguration, CuratorError>;

    async fn escrow(&self, peer: Peer, request: EscrowRequest) -> Result<EscrowResponse, CuratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_request_wire_format() {
        let json = serde_json::json!({"kind": {"kind": "node", "id": "node-01"}});
        let request: WatchRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.kind, WatchKind::Node { id: "node-01".into() });

        let json = serde_json::json!({"kind": {"kind": "all_nodes"}});
        let request: WatchRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.kind, WatchKind::AllNodes);
    }

    #[test]
    fn node_selector_wire_format() {
        let selector: NodeSelector = serde_json::from_value(serde_json::json!({"id": "node-01"})).unwrap();
        assert_eq!(selector, NodeSelector::Id("node-01".into()));
        let selector: NodeSelector = serde_json::from_value(serde_json::json!({"public_key": "AQID"})).unwrap();
        assert_eq!(selector, NodeSelector::PublicKey(vec![1, 2, 3]));
    }

    #[test]
    fn labels_are_sorted() {
        let labels = BTreeMap::from([("zone".to_string(), "a".to_string()), ("arch".to_string(), String::new())]);
        let keys: Vec<_> = labels_to_vec(&labels).into_iter().map(|l| l.key).collect();
        assert_eq!(keys, vec!["arch", "zone"]);
    }
}
