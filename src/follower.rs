//! The implementation served while another node leads.
//!
//! Followers do not proxy. Every call except `get_current_leader` fails with
//! [`CuratorError::NotLeader`], which tells clients to redial the leader.

use std::sync::Arc;

use async_trait::async_trait;
use curator_kv::KeyValueStore;
use tracing::debug;

use crate::authz::Peer;
use crate::error::CuratorError;
use crate::rpc::*;
use crate::state::ClusterConfiguration;
use crate::state::node::NODES;
use crate::state::node::decode_node;

pub struct Follower {
    leader_id: String,
    this_node_id: String,
    store: Arc<dyn KeyValueStore>,
    curator_port: u16,
}

impl Follower {
    pub fn new(
        leader_id: impl Into<String>,
        this_node_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        curator_port: u16,
    ) -> Self {
        Self {
            leader_id: leader_id.into(),
            this_node_id: this_node_id.into(),
            store,
            curator_port,
        }
    }

    pub fn leader_id(&self) -> &str {
        &self.leader_id
    }

    fn not_leader<T>(&self) -> Result<T, CuratorError> {
        Err(CuratorError::NotLeader {
            leader: Some(self.leader_id.clone()),
        })
    }

    /// Address and curator port the leader last reported, if any.
    async fn leader_endpoint(&self) -> Option<(String, u16)> {
        let key = NODES.key(&self.leader_id).ok()?;
        let kv = match self.store.get(&key).await {
            Ok(kv) => kv?,
            Err(e) => {
                debug!(leader = %self.leader_id, error = %e, "could not read leader node");
                return None;
            }
        };
        let node = decode_node(&kv.key, &kv.value).ok()?;
        let status = node.status?;
        let port = status.running_curator.map(|c| c.port).unwrap_or(self.curator_port);
        Some((status.external_address, port))
    }
}

#[async_trait]
impl CuratorService for Follower {
    async fn watch(&self, _: Peer, _: WatchRequest) -> Result<NodeWatchStream, CuratorError> {
        self.not_leader()
    }

    async fn issue_certificate(
        &self,
        _: Peer,
        _: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CuratorError> {
        self.not_leader()
    }

    async fn update_node_status(&self, _: Peer, _: UpdateNodeStatusRequest) -> Result<(), CuratorError> {
        self.not_leader()
    }

    async fn update_node_cluster_networking(
        &self,
        _: Peer,
        _: UpdateNodeClusterNetworkingRequest,
    ) -> Result<(), CuratorError> {
        self.not_leader()
    }

    async fn get_current_leader(&self, _: Peer) -> Result<GetCurrentLeaderResponse, CuratorError> {
        let (leader_host, leader_port) = self.leader_endpoint().await.unwrap_or((String::new(), self.curator_port));
        Ok(GetCurrentLeaderResponse {
            leader_node_id: self.leader_id.clone(),
            leader_host,
            leader_port,
            this_node_id: self.this_node_id.clone(),
        })
    }

    async fn register_node(&self, _: Peer, _: RegisterNodeRequest) -> Result<RegisterNodeResponse, CuratorError> {
        self.not_leader()
    }

    async fn commit_node(&self, _: Peer, _: CommitNodeRequest) -> Result<CommitNodeResponse, CuratorError> {
        self.not_leader()
    }

    async fn join_node(&self, _: Peer, _: JoinNodeRequest) -> Result<JoinNodeResponse, CuratorError> {
        self.not_leader()
    }

    async fn get_register_ticket(&self, _: Peer) -> Result<GetRegisterTicketResponse, CuratorError> {
        self.not_leader()
    }

    async fn get_cluster_info(&self, _: Peer) -> Result<GetClusterInfoResponse, CuratorError> {
        self.not_leader()
    }

    async fn get_nodes(&self, _: Peer, _: GetNodesRequest) -> Result<GetNodesResponse, CuratorError> {
        self.not_leader()
    }

    async fn approve_node(&self, _: Peer, _: ApproveNodeRequest) -> Result<(), CuratorError> {
        self.not_leader()
    }

    async fn update_node_roles(&self, _: Peer, _: UpdateNodeRolesRequest) -> Result<(), CuratorError> {
        self.not_leader()
    }

    async fn update_node_labels(&self, _: Peer, _: UpdateNodeLabelsRequest) -> Result<(), CuratorError> {
        self.not_leader()
    }

    async fn delete_node(&self, _: Peer, _: DeleteNodeRequest) -> Result<(), CuratorError> {
        self.not_leader()
    }

    async fn configure_cluster(&self, _: Peer, _: ConfigureClusterRequest) -> Result<ClusterConfiguration, CuratorError> {
        self.not_leader()
    }

    async fn escrow(&self, _: Peer, _: EscrowRequest) -> Result<EscrowResponse, CuratorError> {
        self.not_leader()
    }
}

#[cfg(test)]
mod tests {
    use curator_kv::MemoryStore;

    use super::*;
    use crate::error::RetryHint;
    use crate::state::Node;
    use crate::state::NodeStatus;
    use crate::state::RunningCurator;
    use crate::state::TpmUsage;
    use crate::state::node::encode_node;

    fn peer() -> Peer {
        Peer::Node {
            id: "node-01".into(),
            public_key: [1u8; 32],
        }
    }

    #[tokio::test]
    async fn rejects_with_leader_hint() {
        let follower = Follower::new("node-aa", "node-bb", MemoryStore::new(), 7835);
        let err = follower.get_nodes(peer(), GetNodesRequest::default()).await.unwrap_err();
        assert_eq!(err.retry_hint(), RetryHint::RedialLeader);
        assert!(matches!(err, CuratorError::NotLeader { leader: Some(ref l) } if l == "node-aa"));
    }

    #[tokio::test]
    async fn reports_leader_endpoint() {
        let store = MemoryStore::new();
        let mut leader = Node::new([4u8; 32], [5u8; 32], TpmUsage::NotPresent);
        leader.status = Some(NodeStatus {
            external_address: "10.0.0.4".into(),
            running_curator: Some(RunningCurator { port: 9000 }),
            timestamp_ms: 1,
        });
        let (key, value) = encode_node(&leader).unwrap();
        store.put(&key, value).await.unwrap();

        let follower = Follower::new(leader.id(), "node-bb", store, 7835);
        let response = follower.get_current_leader(peer()).await.unwrap();
        assert_eq!(response.leader_node_id, leader.id());
        assert_eq!(response.leader_host, "10.0.0.4");
        assert_eq!(response.leader_port, 9000);
        assert_eq!(response.this_node_id, "node-bb");
    }

    #[tokio::test]
    async fn unknown_leader_endpoint_is_empty() {
        let follower = Follower::new("node-aa", "node-bb", MemoryStore::new(), 7835);
        let response = follower.get_current_leader(peer()).await.unwrap();
        assert_eq!(response.leader_host, "");
        assert_eq!(response.leader_port, 7835);
    }
}
