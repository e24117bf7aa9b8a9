//! Owner-facing management RPCs.

use std::collections::HashSet;

use snafu::ResultExt;
use snafu::ensure;
use tracing::info;
use tracing::instrument;

use super::Leader;
use crate::error::CuratorError;
use crate::error::FailedPreconditionSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::OutOfRangeSnafu;
use crate::error::PkiSnafu;
use crate::identity::node_id;
use crate::identity::public_key;
use crate::labels;
use crate::labels::MAX_LABELS_PER_NODE;
use crate::rpc::*;
use crate::state::ClusterConfiguration;
use crate::state::KubernetesControllerRole;
use crate::state::KubernetesWorkerRole;
use crate::state::NodeState;
use crate::state::reconfigure;

/// Nodes listed in the cluster directory.
const MAX_DIRECTORY_NODES: usize = 15;

fn selected_id(selector: &NodeSelector) -> Result<String, CuratorError> {
    match selector {
        NodeSelector::Id(id) => Ok(id.clone()),
        NodeSelector::PublicKey(key) => Ok(node_id(&public_key(key, "public_key")?)),
    }
}

fn invalid_label(e: labels::LabelError) -> CuratorError {
    InvalidArgumentSnafu {
        message: format!("invalid label: {e}"),
    }
    .build()
}

/// Keys and values must be valid and every key may appear only once across upserts and deletes.
fn check_label_update(request: &UpdateNodeLabelsRequest) -> Result<(), CuratorError> {
    let mut seen = HashSet::new();
    for label in &request.upserts {
        labels::validate_key(&label.key).map_err(invalid_label)?;
        labels::validate_value(&label.value).map_err(invalid_label)?;
        ensure!(
            seen.insert(label.key.as_str()),
            InvalidArgumentSnafu {
                message: format!("label {} given more than once", label.key),
            }
        );
    }
    for key in &request.deletes {
        labels::validate_key(key).map_err(invalid_label)?;
        ensure!(
            seen.insert(key.as_str()),
            InvalidArgumentSnafu {
                message: format!("label {key} given more than once"),
            }
        );
    }
    Ok(())
}

impl Leader {
    pub(super) async fn register_ticket(&self) -> Result<GetRegisterTicketResponse, CuratorError> {
        let ticket = self.leadership.ensure_register_ticket().await?;
        Ok(GetRegisterTicketResponse { ticket })
    }

    pub(super) async fn cluster_info(&self) -> Result<GetClusterInfoResponse, CuratorError> {
        let mut directory: Vec<DirectoryNode> = self
            .leadership
            .node_list()
            .await?
            .into_iter()
            .filter(|node| node.state == NodeState::Up)
            .filter_map(|node| {
                let status = node.status?;
                Some(DirectoryNode {
                    public_key: node.public_key,
                    addresses: vec![status.external_address],
                })
            })
            .collect();
        directory.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        directory.truncate(MAX_DIRECTORY_NODES);

        let ca_certificate = self.pki.cluster_ca().ensure(self.leadership.store().as_ref()).await.context(PkiSnafu)?;
        Ok(GetClusterInfoResponse {
            cluster_directory: directory,
            ca_certificate,
            cluster_configuration: self.leadership.cluster_load().await?,
        })
    }

    pub(super) async fn list_nodes(&self, request: GetNodesRequest) -> Result<GetNodesResponse, CuratorError> {
        let nodes = self
            .leadership
            .node_list()
            .await?
            .into_iter()
            .filter(|node| request.state.map_or(true, |state| node.state == state))
            .map(|node| NodeSummary {
                id: node.id(),
                public_key: node.public_key,
                state: node.state,
                labels: labels_to_vec(&node.labels),
                status: node.status,
                tpm_usage: node.tpm_usage,
                roles: node.roles,
            })
            .collect();
        Ok(GetNodesResponse { nodes })
    }

    #[instrument(skip_all)]
    pub(super) async fn approve(&self, request: ApproveNodeRequest) -> Result<(), CuratorError> {
        let id = node_id(&public_key(&request.public_key, "public_key")?);
        let _guard = self.node_lock.lock().await;
        let mut node = self.leadership.node_load(&id).await?;
        match node.state {
            NodeState::New => {
                node.state = NodeState::Standby;
                self.leadership.node_save(&node).await?;
                info!(node_id = %id, "node approved");
                Ok(())
            }
            NodeState::Standby | NodeState::Up => Ok(()),
            NodeState::Decommissioned => FailedPreconditionSnafu {
                message: format!("node {id} is DECOMMISSIONED"),
            }
            .fail(),
        }
    }

    #[instrument(skip_all)]
    pub(super) async fn update_roles(&self, request: UpdateNodeRolesRequest) -> Result<(), CuratorError> {
        let id = selected_id(&request.node)?;
        let _guard = self.node_lock.lock().await;
        let mut node = self.leadership.node_load(&id).await?;

        let remains_controller = request
            .kubernetes_controller
            .unwrap_or(node.roles.kubernetes_controller.is_some());
        match request.consensus_member {
            Some(true) => {
                let address = node.status.as_ref().map(|s| s.external_address.as_str());
                let role = self
                    .consensus
                    .add_node(self.leadership.store().as_ref(), &id, node.public_key, address)
                    .await?;
                node.roles.consensus_member = Some(role);
            }
            Some(false) => {
                ensure!(
                    !remains_controller,
                    FailedPreconditionSnafu {
                        message: "consensus member role cannot be removed while the node is a kubernetes controller",
                    }
                );
                ensure!(
                    id != self.leadership.node_id(),
                    FailedPreconditionSnafu {
                        message: "the leader cannot drop its own consensus member role",
                    }
                );
                self.consensus.remove_node(&id).await?;
                node.roles.consensus_member = None;
            }
            None => {}
        }
        match request.kubernetes_controller {
            Some(true) => {
                ensure!(
                    node.roles.consensus_member.is_some(),
                    FailedPreconditionSnafu {
                        message: "kubernetes controller role requires the consensus member role",
                    }
                );
                node.roles.kubernetes_controller = Some(KubernetesControllerRole {});
            }
            Some(false) => node.roles.kubernetes_controller = None,
            None => {}
        }
        match request.kubernetes_worker {
            Some(true) => node.roles.kubernetes_worker = Some(KubernetesWorkerRole {}),
            Some(false) => node.roles.kubernetes_worker = None,
            None => {}
        }

        self.leadership.node_save(&node).await?;
        info!(
            node_id = %id,
            consensus_member = node.roles.consensus_member.is_some(),
            kubernetes_controller = node.roles.kubernetes_controller.is_some(),
            kubernetes_worker = node.roles.kubernetes_worker.is_some(),
            "node roles updated"
        );
        Ok(())
    }

    #[instrument(skip_all)]
    pub(super) async fn update_labels(&self, request: UpdateNodeLabelsRequest) -> Result<(), CuratorError> {
        let id = selected_id(&request.node)?;
        check_label_update(&request)?;

        let _guard = self.node_lock.lock().await;
        let mut node = self.leadership.node_load(&id).await?;
        for key in &request.deletes {
            node.labels.remove(key);
        }
        for label in request.upserts {
            node.labels.insert(label.key, label.value);
        }
        ensure!(
            node.labels.len() <= MAX_LABELS_PER_NODE,
            OutOfRangeSnafu {
                message: format!("node would have {} labels, at most {MAX_LABELS_PER_NODE} allowed", node.labels.len()),
            }
        );
        self.leadership.node_save(&node).await
    }

    #[instrument(skip_all)]
    pub(super) async fn delete(&self, request: DeleteNodeRequest) -> Result<(), CuratorError> {
        let id = selected_id(&request.node)?;
        ensure!(
            id != self.leadership.node_id(),
            FailedPreconditionSnafu {
                message: "the leader cannot delete itself",
            }
        );

        let _guard = self.node_lock.lock().await;
        let node = self.leadership.node_load(&id).await?;
        ensure!(
            request.bypass_roles || node.roles.is_empty(),
            FailedPreconditionSnafu {
                message: format!("node {id} still has roles"),
            }
        );
        ensure!(
            request.bypass_decommissioned || node.state != NodeState::Up,
            FailedPreconditionSnafu {
                message: format!("node {id} is UP and must be decommissioned first"),
            }
        );
        self.leadership.node_destroy(&node).await?;
        info!(node_id = %id, state = %node.state, "node deleted");
        Ok(())
    }

    #[instrument(skip_all)]
    pub(super) async fn configure(&self, request: ConfigureClusterRequest) -> Result<ClusterConfiguration, CuratorError> {
        let _guard = self.node_lock.lock().await;
        let (existing, mod_revision) = self.leadership.cluster_load_versioned().await?;
        let updated = reconfigure(
            request.base_config.as_ref(),
            request.new_config.as_ref(),
            &existing,
            request.update_mask.as_deref(),
        )?;
        self.leadership.cluster_save_if(&updated, mod_revision).await?;
        info!(mask = ?request.update_mask, "cluster configuration updated");
        Ok(updated)
    }
}
