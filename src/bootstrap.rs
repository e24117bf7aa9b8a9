//! First-node cluster bootstrap.
//!
//! Runs before any curator is elected, so writes go to the store directly
//! and are guarded by create conditions instead of the election lock.

use curator_kv::Compare;
use curator_kv::KeyValueStore;
use curator_kv::TxnOp;
use curator_kv::TxnRequest;
use snafu::OptionExt;
use snafu::ResultExt;
use snafu::ensure;
use tracing::info;
use tracing::instrument;

use crate::consensus::ConsensusAdmin;
use crate::error::CodecSnafu;
use crate::error::CuratorError;
use crate::error::InternalSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::PkiSnafu;
use crate::error::StoreSnafu;
use crate::pki::PkiContext;
use crate::state::ClusterConfiguration;
use crate::state::KubernetesControllerRole;
use crate::state::KubernetesWorkerRole;
use crate::state::Node;
use crate::state::NodeState;
use crate::state::NodeStatus;
use crate::state::TpmUsage;
use crate::state::cluster::CLUSTER_CONFIGURATION_KEY;
use crate::state::global::INITIAL_OWNER_KEY;
use crate::state::node::decode_node_kv;
use crate::state::node::node_put_ops;

/// Parameters of a new cluster.
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    pub initial_owner: Option<[u8; 32]>,
    pub cluster_configuration: ClusterConfiguration,
    pub tpm_usage: TpmUsage,
    pub cluster_unlock_key: Vec<u8>,
    /// Address the first node is reachable at.
    pub external_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    /// The first node as stored.
    pub node: Node,
    pub ca_certificate: Vec<u8>,
    pub node_certificate: Vec<u8>,
    /// False when the cluster had already been bootstrapped by this node.
    pub created: bool,
}

/// Whether cluster state has been written to `store`.
pub async fn is_bootstrapped(store: &dyn KeyValueStore) -> Result<bool, CuratorError> {
    Ok(store.get(CLUSTER_CONFIGURATION_KEY).await.context(StoreSnafu)?.is_some())
}

/// Write the initial cluster state with `node_key` as the first node.
///
/// Calling this again with the same node key returns the existing material.
#[instrument(skip_all, fields(node_id = %crate::identity::node_id(&node_key)))]
pub async fn bootstrap_cluster(
    store: &dyn KeyValueStore,
    consensus: &ConsensusAdmin,
    pki: &PkiContext,
    node_key: [u8; 32],
    join_key: [u8; 32],
    params: BootstrapParams,
) -> Result<BootstrapResult, CuratorError> {
    params.cluster_configuration.validate()?;
    if let Some(address) = &params.external_address {
        ensure!(
            address.parse::<std::net::IpAddr>().is_ok(),
            InvalidArgumentSnafu {
                message: format!("external address '{address}' is not an IP address"),
            }
        );
    }

    let ca_certificate = pki.cluster_ca().ensure(store).await.context(PkiSnafu)?;
    let node_certificate = pki.node_certificate(node_key).ensure(store).await.context(PkiSnafu)?;

    let mut node = Node::new(node_key, join_key, params.tpm_usage);
    let id = node.id();
    let role = consensus.add_node(store, &id, node_key, params.external_address.as_deref()).await?;
    node.state = NodeState::Up;
    node.cluster_unlock_key = params.cluster_unlock_key;
    node.status = params.external_address.map(|external_address| NodeStatus {
        external_address,
        running_curator: None,
        timestamp_ms: 0,
    });
    node.roles.consensus_member = Some(role);
    node.roles.kubernetes_controller = Some(KubernetesControllerRole {});
    node.roles.kubernetes_worker = Some(KubernetesWorkerRole {});

    let node_key_path = node.key()?;
    let config = serde_json::to_vec(&params.cluster_configuration).context(CodecSnafu {
        key: CLUSTER_CONFIGURATION_KEY,
    })?;
    let mut compare = vec![Compare::absent(node_key_path.as_str()), Compare::absent(CLUSTER_CONFIGURATION_KEY)];
    let mut ops = node_put_ops(&node)?;
    ops.push(TxnOp::put(CLUSTER_CONFIGURATION_KEY, config));
    if let Some(owner) = params.initial_owner {
        compare.push(Compare::absent(INITIAL_OWNER_KEY));
        ops.push(TxnOp::put(INITIAL_OWNER_KEY, owner.to_vec()));
    }

    let request = TxnRequest::new().when(compare).then(ops).or_else([TxnOp::get(node_key_path.as_str())]);
    let response = store.txn(request).await.context(StoreSnafu)?;
    if response.succeeded {
        info!(revision = response.revision, "cluster bootstrapped");
        return Ok(BootstrapResult {
            node,
            ca_certificate,
            node_certificate,
            created: true,
        });
    }

    let kv = response.kv(0).context(InternalSnafu {
        message: "cluster already bootstrapped by another node",
    })?;
    let existing = decode_node_kv(kv)?;
    info!("cluster already bootstrapped");
    Ok(BootstrapResult {
        node: existing,
        ca_certificate,
        node_certificate,
        created: false,
    })
}
