//! The implementation served while this node leads.
//!
//! All state access goes through [`Leadership`], so every write is fenced by
//! the election lock. Handlers that change roles, state or labels of nodes
//! hold the node mutex, which the membership reconciler shares.

mod aaa;
mod curator;
mod management;
pub mod reconciler;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::authz::Peer;
use crate::consensus::ConsensusAdmin;
use crate::error::CuratorError;
use crate::leadership::Leadership;
use crate::networking::IpPrefix;
use crate::pki::PkiContext;
use crate::rpc::*;
use crate::state::ClusterConfiguration;

pub use reconciler::ReconcileOutcome;

#[derive(Debug, Clone)]
pub struct LeaderSettings {
    /// Network within which nodes may advertise prefixes.
    pub cluster_network: IpPrefix,
    /// Port this curator serves on, reported to clients.
    pub curator_port: u16,
}

pub struct Leader {
    leadership: Leadership,
    pki: Arc<PkiContext>,
    consensus: Arc<ConsensusAdmin>,
    settings: LeaderSettings,
    node_lock: Mutex<()>,
}

impl Leader {
    pub fn new(
        leadership: Leadership,
        pki: Arc<PkiContext>,
        consensus: Arc<ConsensusAdmin>,
        settings: LeaderSettings,
    ) -> Self {
        Self {
            leadership,
            pki,
            consensus,
            settings,
            node_lock: Mutex::new(()),
        }
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }
}

#[async_trait]
impl CuratorService for Leader {
    async fn watch(&self, peer: Peer, request: WatchRequest) -> Result<NodeWatchStream, CuratorError> {
        self.watch_nodes(&peer, request).await
    }

    async fn issue_certificate(
        &self,
        peer: Peer,
        request: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CuratorError> {
        self.issue_node_certificate(&peer, request).await
    }

    async fn update_node_status(&self, peer: Peer, request: UpdateNodeStatusRequest) -> Result<(), CuratorError> {
        self.update_status(&peer, request).await
    }

    async fn update_node_cluster_networking(
        &self,
        peer: Peer,
        request: UpdateNodeClusterNetworkingRequest,
    ) -> Result<(), CuratorError> {
        self.update_networking(&peer, request).await
    }

    async fn get_current_leader(&self, _peer: Peer) -> Result<GetCurrentLeaderResponse, CuratorError> {
        self.current_leader().await
    }

    async fn register_node(&self, peer: Peer, request: RegisterNodeRequest) -> Result<RegisterNodeResponse, CuratorError> {
        self.register(&peer, request).await
    }

    async fn commit_node(&self, peer: Peer, request: CommitNodeRequest) -> Result<CommitNodeResponse, CuratorError> {
        self.commit(&peer, request).await
    }

    async fn join_node(&self, peer: Peer, request: JoinNodeRequest) -> Result<JoinNodeResponse, CuratorError> {
        self.join(&peer, request).await
    }

    async fn get_register_ticket(&self, _peer: Peer) -> Result<GetRegisterTicketResponse, CuratorError> {
        self.register_ticket().await
    }

    async fn get_cluster_info(&self, _peer: Peer) -> Result<GetClusterInfoResponse, CuratorError> {
        self.cluster_info().await
    }

    async fn get_nodes(&self, _peer: Peer, request: GetNodesRequest) -> Result<GetNodesResponse, CuratorError> {
        self.list_nodes(request).await
    }

    async fn approve_node(&self, _peer: Peer, request: ApproveNodeRequest) -> Result<(), CuratorError> {
        self.approve(request).await
    }

    async fn update_node_roles(&self, _peer: Peer, request: UpdateNodeRolesRequest) -> Result<(), CuratorError> {
        self.update_roles(request).await
    }

    async fn update_node_labels(&self, _peer: Peer, request: UpdateNodeLabelsRequest) -> Result<(), CuratorError> {
        self.update_labels(request).await
    }

    async fn delete_node(&self, _peer: Peer, request: DeleteNodeRequest) -> Result<(), CuratorError> {
        self.delete(request).await
    }

    async fn configure_cluster(
        &self,
        _peer: Peer,
        request: ConfigureClusterRequest,
    ) -> Result<ClusterConfiguration, CuratorError> {
        self.configure(request).await
    }

    async fn escrow(&self, peer: Peer, request: EscrowRequest) -> Result<EscrowResponse, CuratorError> {
        self.escrow_owner(&peer, request).await
    }
}
