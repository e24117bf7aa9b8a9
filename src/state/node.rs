//! Node records.
//!
//! A node is stored as JSON at `/nodes/<id>`. Its join key is indexed at
//! `/join_keys/<hex(join_key)>`, whose value is the node ID. Both keys are
//! always written and deleted together.

use std::collections::BTreeMap;
use std::fmt;

use curator_kv::KeyValue;
use curator_kv::KeyspacePrefix;
use curator_kv::TxnOp;
use serde::Deserialize;
use serde::Serialize;
use snafu::OptionExt;
use snafu::ResultExt;

use crate::codec;
use crate::error::CodecSnafu;
use crate::error::CuratorError;
use crate::error::InternalSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::NotFoundSnafu;
use crate::identity::node_id;
use crate::leadership::Leadership;

pub const NODES: KeyspacePrefix = KeyspacePrefix::from_static("/nodes/");
pub const JOIN_KEYS: KeyspacePrefix = KeyspacePrefix::from_static("/join_keys/");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Registered, waiting for approval.
    New,
    /// Approved, waiting to commit.
    Standby,
    /// Fully part of the cluster.
    Up,
    Decommissioned,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::New => "NEW",
            NodeState::Standby => "STANDBY",
            NodeState::Up => "UP",
            NodeState::Decommissioned => "DECOMMISSIONED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpmUsage {
    PresentAndUsed,
    PresentButUnused,
    NotPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningCurator {
    pub port: u16,
}

/// Self-reported node status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub external_address: String,
    #[serde(default)]
    pub running_curator: Option<RunningCurator>,
    /// Milliseconds since the Unix epoch at which the leader accepted the status.
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPeer {
    pub name: String,
    pub url: String,
}

/// Everything a node needs to run a consensus member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMemberRole {
    #[serde(with = "codec::base64_bytes")]
    pub ca_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub peer_certificate: Vec<u8>,
    #[serde(with = "codec::base64_bytes")]
    pub crl: Vec<u8>,
    pub peers: Vec<ConsensusPeer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesControllerRole {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesWorkerRole {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoles {
    #[serde(default)]
    pub consensus_member: Option<ConsensusMemberRole>,
    #[serde(default)]
    pub kubernetes_controller: Option<KubernetesControllerRole>,
    #[serde(default)]
    pub kubernetes_worker: Option<KubernetesWorkerRole>,
}

impl NodeRoles {
    pub fn is_empty(&self) -> bool {
        self.consensus_member.is_none() && self.kubernetes_controller.is_none() && self.kubernetes_worker.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetworking {
    /// Base64 WireGuard public key.
    pub wireguard_pubkey: String,
    /// Canonical CIDR prefixes routed to this node.
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(with = "codec::hex_key")]
    pub public_key: [u8; 32],
    #[serde(with = "codec::hex_key")]
    pub join_key: [u8; 32],
    #[serde(with = "codec::base64_bytes", default)]
    pub cluster_unlock_key: Vec<u8>,
    pub state: NodeState,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    pub tpm_usage: TpmUsage,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub roles: NodeRoles,
    #[serde(default)]
    pub cluster_networking: Option<ClusterNetworking>,
}

impl Node {
    /// A freshly registered node.
    pub fn new(public_key: [u8; 32], join_key: [u8; 32], tpm_usage: TpmUsage) -> Self {
        Self {
            public_key,
            join_key,
            cluster_unlock_key: Vec::new(),
            state: NodeState::New,
            status: None,
            tpm_usage,
            labels: BTreeMap::new(),
            roles: NodeRoles::default(),
            cluster_networking: None,
        }
    }

    pub fn id(&self) -> String {
        node_id(&self.public_key)
    }

    pub fn key(&self) -> Result<String, CuratorError> {
        node_key(&self.id())
    }

    pub fn join_key_index(&self) -> Result<String, CuratorError> {
        join_key_index(&self.join_key)
    }
}

fn node_key(id: &str) -> Result<String, CuratorError> {
    NODES.key(id).map_err(|e| {
        InvalidArgumentSnafu {
            message: format!("invalid node id: {e}"),
        }
        .build()
    })
}

fn join_key_index(join_key: &[u8; 32]) -> Result<String, CuratorError> {
    JOIN_KEYS.key(&hex::encode(join_key)).map_err(|e| {
        InternalSnafu {
            message: format!("invalid join key index: {e}"),
        }
        .build()
    })
}

/// Decode a stored node and check that it lives under the key derived from its public key.
pub fn decode_node(key: &str, value: &[u8]) -> Result<Node, CuratorError> {
    let node: Node = serde_json::from_slice(value).context(CodecSnafu { key })?;
    let id = NODES.extract_id(key).context(InternalSnafu {
        message: format!("'{key}' is not a node key"),
    })?;
    if node.id() != id {
        return InternalSnafu {
            message: format!("node at '{key}' has public key of {}", node.id()),
        }
        .fail();
    }
    Ok(node)
}

pub(crate) fn decode_node_kv(kv: &KeyValue) -> Result<Node, CuratorError> {
    decode_node(&kv.key, &kv.value)
}

pub(crate) fn encode_node(node: &Node) -> Result<(String, Vec<u8>), CuratorError> {
    let key = node.key()?;
    let value = serde_json::to_vec(node).context(CodecSnafu { key: key.clone() })?;
    Ok((key, value))
}

/// Puts writing a node record and its join key index.
pub(crate) fn node_put_ops(node: &Node) -> Result<Vec<TxnOp>, CuratorError> {
    let (key, value) = encode_node(node)?;
    let id = node.id();
    Ok(vec![TxnOp::put(key, value), TxnOp::put(node.join_key_index()?, id.into_bytes())])
}

impl Leadership {
    pub async fn node_save(&self, node: &Node) -> Result<(), CuratorError> {
        self.txn_as_leader(node_put_ops(node)?).await?;
        Ok(())
    }

    pub async fn node_load(&self, id: &str) -> Result<Node, CuratorError> {
        let key = node_key(id)?;
        let response = self.txn_as_leader([TxnOp::get(key.as_str())]).await?;
        let kv = response.kv(0).context(NotFoundSnafu {
            message: format!("node {id} not found"),
        })?;
        decode_node_kv(kv)
    }

    pub async fn node_destroy(&self, node: &Node) -> Result<(), CuratorError> {
        self.txn_as_leader([TxnOp::delete(node.key()?), TxnOp::delete(node.join_key_index()?)]).await?;
        Ok(())
    }

    pub async fn node_id_by_join_key(&self, join_key: &[u8; 32]) -> Result<String, CuratorError> {
        let key = join_key_index(join_key)?;
        let response = self.txn_as_leader([TxnOp::get(key.as_str())]).await?;
        let kv = response.kv(0).context(NotFoundSnafu {
            message: "no node registered with this join key",
        })?;
        String::from_utf8(kv.value.clone()).map_err(|_| {
            InternalSnafu {
                message: format!("join key index at '{key}' is not UTF-8"),
            }
            .build()
        })
    }

    /// Every node, ordered by ID.
    pub async fn node_list(&self) -> Result<Vec<Node>, CuratorError> {
        let response = self.txn_as_leader([TxnOp::range(NODES.range())]).await?;
        response.kvs(0).iter().map(decode_node_kv).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::collections::HashSet;

    use curator_kv::KeyValueStore;
    use curator_kv::MemoryStore;
    use proptest::prelude::*;

    use super::*;

    fn node(seed: u8) -> Node {
        let mut node = Node::new([seed; 32], [seed ^ 0xff; 32], TpmUsage::NotPresent);
        node.labels.insert("zone".into(), "a".into());
        node
    }

    async fn leadership(store: &Arc<MemoryStore>) -> Leadership {
        let rev = store.put("/leader/1", b"x".to_vec()).await.unwrap();
        Leadership::new(store.clone(), "/leader/1", rev, "node-local")
    }

    #[test]
    fn unknown_state_is_rejected() {
        let mut json = serde_json::to_value(node(1)).unwrap();
        json["state"] = "exploded".into();
        let key = NODES.key(&node(1).id()).unwrap();
        let err = decode_node(&key, &serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert!(matches!(err, CuratorError::Codec { .. }));
    }

    #[test]
    fn key_must_match_public_key() {
        let (_, value) = encode_node(&node(1)).unwrap();
        let other = NODES.key(&node(2).id()).unwrap();
        assert!(matches!(decode_node(&other, &value), Err(CuratorError::Internal { .. })));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = MemoryStore::new();
        let leadership = leadership(&store).await;
        let err = leadership.node_load("node-00").await.unwrap_err();
        assert!(matches!(err, CuratorError::NotFound { .. }));
        let err = leadership.node_load("bad/id").await.unwrap_err();
        assert!(matches!(err, CuratorError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn save_writes_index_and_destroy_removes_it() {
        let store = MemoryStore::new();
        let leadership = leadership(&store).await;
        let node = node(7);
        leadership.node_save(&node).await.unwrap();

        assert_eq!(leadership.node_id_by_join_key(&node.join_key).await.unwrap(), node.id());
        assert_eq!(leadership.node_load(&node.id()).await.unwrap(), node);
        assert_eq!(leadership.node_list().await.unwrap().len(), 1);

        leadership.node_destroy(&node).await.unwrap();
        assert!(matches!(
            leadership.node_id_by_join_key(&node.join_key).await,
            Err(CuratorError::NotFound { .. })
        ));
        assert!(store.get(&node.key().unwrap()).await.unwrap().is_none());
    }

    fn arb_state() -> impl Strategy<Value = NodeState> {
        prop_oneof![
            Just(NodeState::New),
            Just(NodeState::Standby),
            Just(NodeState::Up),
            Just(NodeState::Decommissioned),
        ]
    }

    fn arb_tpm_usage() -> impl Strategy<Value = TpmUsage> {
        prop_oneof![
            Just(TpmUsage::PresentAndUsed),
            Just(TpmUsage::PresentButUnused),
            Just(TpmUsage::NotPresent),
        ]
    }

    prop_compose! {
        fn arb_status()(
            external_address in "[0-9]{1,3}(\\.[0-9]{1,3}){3}",
            port in prop::option::of(any::<u16>()),
            timestamp_ms in any::<u64>(),
        ) -> NodeStatus {
            NodeStatus {
                external_address,
                running_curator: port.map(|port| RunningCurator { port }),
                timestamp_ms,
            }
        }
    }

    prop_compose! {
        fn arb_consensus_member()(
            ca_certificate in prop::collection::vec(any::<u8>(), 0..64),
            peer_certificate in prop::collection::vec(any::<u8>(), 0..64),
            crl in prop::collection::vec(any::<u8>(), 0..32),
            peers in prop::collection::vec(("node-[0-9a-f]{4}", "https://[a-z]{1,8}:[0-9]{4}"), 0..4),
        ) -> ConsensusMemberRole {
            ConsensusMemberRole {
                ca_certificate,
                peer_certificate,
                crl,
                peers: peers.into_iter().map(|(name, url)| ConsensusPeer { name, url }).collect(),
            }
        }
    }

    prop_compose! {
        fn arb_roles()(
            consensus_member in prop::option::of(arb_consensus_member()),
            controller in any::<bool>(),
            worker in any::<bool>(),
        ) -> NodeRoles {
            NodeRoles {
                consensus_member,
                kubernetes_controller: controller.then(KubernetesControllerRole::default),
                kubernetes_worker: worker.then(KubernetesWorkerRole::default),
            }
        }
    }

    prop_compose! {
        fn arb_networking()(
            wireguard_pubkey in "[A-Za-z0-9+/]{43}=",
            prefixes in prop::collection::vec("10\\.[0-9]{1,3}\\.0\\.0/16", 0..3),
        ) -> ClusterNetworking {
            ClusterNetworking { wireguard_pubkey, prefixes }
        }
    }

    prop_compose! {
        fn arb_node()(
            public_key in any::<[u8; 32]>(),
            join_key in any::<[u8; 32]>(),
            cluster_unlock_key in prop::collection::vec(any::<u8>(), 0..48),
            state in arb_state(),
            status in prop::option::of(arb_status()),
            tpm_usage in arb_tpm_usage(),
            labels in prop::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..6),
            roles in arb_roles(),
            cluster_networking in prop::option::of(arb_networking()),
        ) -> Node {
            Node {
                public_key,
                join_key,
                cluster_unlock_key,
                state,
                status,
                tpm_usage,
                labels,
                roles,
                cluster_networking,
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn encoded_node_decodes_to_itself(node in arb_node()) {
            let (key, value) = encode_node(&node).unwrap();
            prop_assert_eq!(decode_node(&key, &value).unwrap(), node);
        }

        #[test]
        fn saved_nodes_load_back_and_stay_indexed(
            nodes in prop::collection::vec(arb_node(), 1..6),
            destroy in prop::collection::vec(any::<bool>(), 6),
        ) {
            let mut public_keys = HashSet::new();
            let mut join_keys = HashSet::new();
            prop_assume!(nodes.iter().all(|n| public_keys.insert(n.public_key) && join_keys.insert(n.join_key)));

            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = MemoryStore::new();
                let leadership = leadership(&store).await;

                for node in &nodes {
                    leadership.node_save(node).await.unwrap();
                    prop_assert_eq!(leadership.node_load(&node.id()).await.unwrap(), node.clone());
                    prop_assert_eq!(leadership.node_id_by_join_key(&node.join_key).await.unwrap(), node.id());
                }
                prop_assert_eq!(leadership.node_list().await.unwrap().len(), nodes.len());

                for (node, gone) in nodes.iter().zip(&destroy) {
                    if *gone {
                        leadership.node_destroy(node).await.unwrap();
                    }
                }
                for (node, gone) in nodes.iter().zip(&destroy) {
                    let record = store.get(&node.key().unwrap()).await.unwrap();
                    let index = store.get(&node.join_key_index().unwrap()).await.unwrap();
                    prop_assert_eq!(record.is_none(), *gone);
                    prop_assert_eq!(index.is_none(), *gone);
                    if !*gone {
                        prop_assert_eq!(leadership.node_id_by_join_key(&node.join_key).await.unwrap(), node.id());
                    }
                }
                Ok(())
            })?;
        }
    }
}
