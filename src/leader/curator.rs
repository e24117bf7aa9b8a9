//! Node-facing RPCs: watch, certificates, status, networking and registration.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use curator_kv::EventKind;
use curator_kv::KeyValueStore;
use curator_kv::TxnOp;
use curator_kv::WatchRequest as StoreWatchRequest;
use curator_kv::WatchResponse;
use curator_kv::WatchStream;
use futures::StreamExt;
use snafu::ResultExt;
use snafu::ensure;
use subtle::ConstantTimeEq;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::Leader;
use crate::authz::Peer;
use crate::error::CuratorError;
use crate::error::FailedPreconditionSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::PermissionDeniedSnafu;
use crate::error::PkiSnafu;
use crate::error::UnauthenticatedSnafu;
use crate::error::UnavailableSnafu;
use crate::identity::node_id;
use crate::identity::public_key;
use crate::labels;
use crate::labels::MAX_LABELS_PER_NODE;
use crate::networking::check_prefix;
use crate::networking::parse_wireguard_key;
use crate::rpc::*;
use crate::state::ClusterNetworking;
use crate::state::Node;
use crate::state::NodeState;
use crate::state::StorageSecurity;
use crate::state::TpmMode;
use crate::state::TpmUsage;
use crate::state::node::NODES;
use crate::state::node::decode_node_kv;

const WATCH_RETRY_DELAY: Duration = Duration::from_millis(100);

fn caller_node_id(peer: &Peer) -> Result<&str, CuratorError> {
    peer.node_id().ok_or_else(|| {
        PermissionDeniedSnafu {
            message: "only cluster nodes may call this method",
        }
        .build()
    })
}

/// The key of a self-signed certificate the caller connected with.
fn transport_key(peer: &Peer) -> Result<[u8; 32], CuratorError> {
    peer.transport_key().ok_or_else(|| {
        UnauthenticatedSnafu {
            message: "connection must be established with a self-signed ephemeral certificate",
        }
        .build()
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn watched(node: &Node) -> WatchedNode {
    WatchedNode {
        id: node.id(),
        public_key: node.public_key,
        state: node.state,
        status: node.status.clone(),
        roles: node.roles.clone(),
        cluster_networking: node.cluster_networking.clone(),
    }
}

/// Translate one batch of store events into a watch event. Batches that
/// touch no node yield `None`.
fn node_event(response: WatchResponse) -> Result<Option<WatchEvent>, CuratorError> {
    let mut event = WatchEvent::default();
    for change in response.events {
        match change.kind {
            EventKind::Put => event.nodes.push(watched(&decode_node_kv(&change.kv)?)),
            EventKind::Delete => {
                if let Some(id) = NODES.extract_id(&change.kv.key) {
                    event.tombstones.push(id.to_string());
                }
            }
        }
    }
    if event.nodes.is_empty() && event.tombstones.is_empty() {
        return Ok(None);
    }
    Ok(Some(event))
}

struct WatchCursor {
    store: Arc<dyn KeyValueStore>,
    request: StoreWatchRequest,
    stream: Option<WatchStream>,
    done: bool,
}

/// Stream node changes starting at `request.start_revision`.
///
/// Transient store errors re-establish the watch from the revision after
/// the last delivered one. Anything else ends the stream with an error.
fn node_updates(store: Arc<dyn KeyValueStore>, request: StoreWatchRequest) -> NodeWatchStream {
    let cursor = WatchCursor {
        store,
        request,
        stream: None,
        done: false,
    };
    futures::stream::unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return None;
        }
        loop {
            if cursor.stream.is_none() {
                match cursor.store.watch(cursor.request.clone()).await {
                    Ok(stream) => cursor.stream = Some(stream),
                    Err(e) => {
                        cursor.done = true;
                        return Some((Err(CuratorError::from(e)), cursor));
                    }
                }
            }
            let Some(stream) = cursor.stream.as_mut() else {
                continue;
            };
            match stream.next().await {
                Some(Ok(response)) => {
                    cursor.request.start_revision = response.revision + 1;
                    match node_event(response) {
                        Ok(Some(event)) => return Some((Ok(event), cursor)),
                        Ok(None) => continue,
                        Err(e) => {
                            cursor.done = true;
                            return Some((Err(e), cursor));
                        }
                    }
                }
                Some(Err(e)) if e.is_transient() => {
                    warn!(error = %e, revision = cursor.request.start_revision, "node watch interrupted, re-establishing");
                    cursor.stream = None;
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                Some(Err(e)) => {
                    cursor.done = true;
                    return Some((Err(CuratorError::from(e)), cursor));
                }
                None => {
                    cursor.done = true;
                    let closed = UnavailableSnafu {
                        message: "node watch closed",
                    }
                    .build();
                    return Some((Err(closed), cursor));
                }
            }
        }
    })
    .boxed()
}

impl Leader {
    #[instrument(skip_all, fields(peer = %peer))]
    pub(super) async fn watch_nodes(&self, peer: &Peer, request: WatchRequest) -> Result<NodeWatchStream, CuratorError> {
        caller_node_id(peer)?;
        let (read, watch) = match &request.kind {
            WatchKind::Node { id } => {
                let key = NODES.key(id).map_err(|e| {
                    InvalidArgumentSnafu {
                        message: format!("invalid node id: {e}"),
                    }
                    .build()
                })?;
                (TxnOp::get(key.as_str()), StoreWatchRequest::key(key))
            }
            WatchKind::AllNodes => (TxnOp::range(NODES.range()), StoreWatchRequest::range(NODES.range())),
        };

        let response = self.leadership.txn_as_leader([read]).await?;
        let nodes = response
            .kvs(0)
            .iter()
            .map(|kv| decode_node_kv(kv).map(|node| watched(&node)))
            .collect::<Result<Vec<_>, _>>()?;
        let backlog = WatchEvent {
            nodes,
            tombstones: Vec::new(),
            progress: Some(Progress::LastBacklogSent),
        };
        debug!(nodes = backlog.nodes.len(), revision = response.revision, "sending watch backlog");

        let updates = node_updates(self.leadership.store().clone(), watch.from_revision(response.revision + 1));
        Ok(futures::stream::once(async move { Ok(backlog) }).chain(updates).boxed())
    }

    #[instrument(skip_all, fields(peer = %peer))]
    pub(super) async fn issue_node_certificate(
        &self,
        peer: &Peer,
        request: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CuratorError> {
        let id = caller_node_id(peer)?;
        let node = self.leadership.node_load(id).await?;
        let IssueCertificateRequest::KubernetesWorker(keys) = request;
        ensure!(
            node.roles.kubernetes_worker.is_some(),
            PermissionDeniedSnafu {
                message: "node is not a kubernetes worker",
            }
        );

        let kubelet = public_key(&keys.kubelet_pubkey, "kubelet_pubkey")?;
        let csi = public_key(&keys.csi_provisioner_pubkey, "csi_provisioner_pubkey")?;
        let netservices = public_key(&keys.netservices_pubkey, "netservices_pubkey")?;

        let store = self.leadership.store().as_ref();
        let certificates = KubernetesWorkerCertificates {
            identity_ca_certificate: self.pki.kube_ca().ensure(store).await.context(PkiSnafu)?,
            kubelet_server_certificate: self.pki.kubelet_server(id, kubelet).ensure(store).await.context(PkiSnafu)?,
            kubelet_client_certificate: self.pki.kubelet_client(id, kubelet).ensure(store).await.context(PkiSnafu)?,
            csi_provisioner_certificate: self.pki.csi_provisioner(id, csi).ensure(store).await.context(PkiSnafu)?,
            netservices_certificate: self.pki.netservices(id, netservices).ensure(store).await.context(PkiSnafu)?,
        };
        info!(node_id = %id, "issued kubernetes worker certificates");
        Ok(IssueCertificateResponse::KubernetesWorker(certificates))
    }

    #[instrument(skip_all, fields(peer = %peer, node_id = %request.node_id))]
    pub(super) async fn update_status(&self, peer: &Peer, request: UpdateNodeStatusRequest) -> Result<(), CuratorError> {
        let id = caller_node_id(peer)?;
        ensure!(
            id == request.node_id,
            PermissionDeniedSnafu {
                message: "nodes may only update their own status",
            }
        );
        ensure!(
            request.status.external_address.parse::<IpAddr>().is_ok(),
            InvalidArgumentSnafu {
                message: format!("external_address '{}' is not an IP address", request.status.external_address),
            }
        );

        let _guard = self.node_lock.lock().await;
        let mut node = self.leadership.node_load(id).await?;
        let mut status = request.status;
        status.timestamp_ms = now_ms();
        node.status = Some(status);
        self.leadership.node_save(&node).await
    }

    #[instrument(skip_all, fields(peer = %peer))]
    pub(super) async fn update_networking(
        &self,
        peer: &Peer,
        request: UpdateNodeClusterNetworkingRequest,
    ) -> Result<(), CuratorError> {
        let id = caller_node_id(peer)?;
        let key = parse_wireguard_key(&request.wireguard_pubkey).ok_or_else(|| {
            InvalidArgumentSnafu {
                message: "wireguard_pubkey must be base64 of 32 bytes",
            }
            .build()
        })?;

        let _guard = self.node_lock.lock().await;
        let nodes = self.leadership.node_list().await?;
        let Some(mut node) = nodes.iter().find(|n| n.id() == id).cloned() else {
            return FailedPreconditionSnafu {
                message: format!("node {id} not found"),
            }
            .fail();
        };
        let Some(status) = &node.status else {
            return FailedPreconditionSnafu {
                message: "node needs to submit at least one status update",
            }
            .fail();
        };
        let external_address = status.external_address.parse::<IpAddr>().ok();

        let duplicate = nodes.iter().filter(|n| n.id() != id).any(|n| {
            n.cluster_networking
                .as_ref()
                .and_then(|net| parse_wireguard_key(&net.wireguard_pubkey))
                .is_some_and(|other| other == key)
        });
        ensure!(
            !duplicate,
            InvalidArgumentSnafu {
                message: "wireguard_pubkey is already used by another node",
            }
        );

        for prefix in &request.prefixes {
            check_prefix(prefix, &self.settings.cluster_network, external_address)
                .map_err(|message| InvalidArgumentSnafu { message }.build())?;
        }

        node.cluster_networking = Some(ClusterNetworking {
            wireguard_pubkey: request.wireguard_pubkey,
            prefixes: request.prefixes,
        });
        self.leadership.node_save(&node).await
    }

    pub(super) async fn current_leader(&self) -> Result<GetCurrentLeaderResponse, CuratorError> {
        let id = self.leadership.node_id().to_string();
        let host = match self.leadership.node_load(&id).await {
            Ok(node) => node.status.map(|s| s.external_address).unwrap_or_default(),
            Err(CuratorError::NotFound { .. }) => String::new(),
            Err(e) => return Err(e),
        };
        Ok(GetCurrentLeaderResponse {
            leader_node_id: id.clone(),
            leader_host: host,
            leader_port: self.settings.curator_port,
            this_node_id: id,
        })
    }

    #[instrument(skip_all)]
    pub(super) async fn register(&self, peer: &Peer, request: RegisterNodeRequest) -> Result<RegisterNodeResponse, CuratorError> {
        let node_key = transport_key(peer)?;
        let join_key = public_key(&request.join_key, "join_key")?;

        let ticket = self.leadership.ensure_register_ticket().await?;
        let valid: bool = ticket.as_slice().ct_eq(request.register_ticket.as_slice()).into();
        ensure!(
            valid,
            PermissionDeniedSnafu {
                message: "register ticket invalid",
            }
        );

        let cluster = self.leadership.cluster_load().await?;
        let tpm_usage = cluster.tpm_mode.node_tpm_usage(request.have_local_tpm)?;
        let response = RegisterNodeResponse {
            recommended_storage_security: cluster.storage_security_policy.recommended(),
            cluster_configuration: cluster,
            tpm_usage,
        };

        let id = node_id(&node_key);
        let _guard = self.node_lock.lock().await;
        match self.leadership.node_load(&id).await {
            Ok(existing) if existing.state == NodeState::New => {
                debug!(node_id = %id, "node already registered");
                return Ok(response);
            }
            Ok(existing) => {
                return FailedPreconditionSnafu {
                    message: format!("node already exists in cluster, state {}", existing.state),
                }
                .fail();
            }
            Err(CuratorError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        match self.leadership.node_id_by_join_key(&join_key).await {
            Ok(owner) => {
                return FailedPreconditionSnafu {
                    message: format!("join key already used by {owner}"),
                }
                .fail();
            }
            Err(CuratorError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let mut node = Node::new(node_key, join_key, tpm_usage);
        for label in request.labels {
            if node.labels.len() >= MAX_LABELS_PER_NODE {
                debug!(node_id = %id, "dropping labels beyond limit");
                break;
            }
            if let Err(e) = labels::validate_key(&label.key).and_then(|_| labels::validate_value(&label.value)) {
                debug!(node_id = %id, key = %label.key, error = %e, "skipping invalid label");
                continue;
            }
            if node.labels.contains_key(&label.key) {
                debug!(node_id = %id, key = %label.key, "skipping duplicate label");
                continue;
            }
            node.labels.insert(label.key, label.value);
        }
        self.leadership.node_save(&node).await?;
        info!(node_id = %id, tpm_usage = ?tpm_usage, labels = node.labels.len(), "node registered");
        Ok(response)
    }

    #[instrument(skip_all)]
    pub(super) async fn commit(&self, peer: &Peer, request: CommitNodeRequest) -> Result<CommitNodeResponse, CuratorError> {
        let node_key = transport_key(peer)?;
        let cluster = self.leadership.cluster_load().await?;
        ensure!(
            cluster.storage_security_policy.permits(request.storage_security),
            FailedPreconditionSnafu {
                message: format!(
                    "storage security {:?} not permitted by cluster policy {:?}",
                    request.storage_security, cluster.storage_security_policy
                ),
            }
        );

        let id = node_id(&node_key);
        let _guard = self.node_lock.lock().await;
        let mut node = self.leadership.node_load(&id).await?;
        match node.state {
            NodeState::Standby => {}
            NodeState::New => {
                return PermissionDeniedSnafu {
                    message: "node is NEW, wait for attestation/approval",
                }
                .fail();
            }
            NodeState::Up | NodeState::Decommissioned => {
                return FailedPreconditionSnafu {
                    message: format!("node is {}, cannot commit", node.state),
                }
                .fail();
            }
        }
        if request.storage_security != StorageSecurity::Insecure {
            public_key(&request.cluster_unlock_key, "cluster_unlock_key")?;
        }

        let store = self.leadership.store().as_ref();
        let ca_certificate = self.pki.cluster_ca().ensure(store).await.context(PkiSnafu)?;
        let node_certificate = self.pki.node_certificate(node_key).ensure(store).await.context(PkiSnafu)?;

        node.cluster_unlock_key = request.cluster_unlock_key;
        node.state = NodeState::Up;
        self.leadership.node_save(&node).await?;
        info!(node_id = %id, "node committed");
        Ok(CommitNodeResponse {
            ca_certificate,
            node_certificate,
        })
    }

    #[instrument(skip_all)]
    pub(super) async fn join(&self, peer: &Peer, request: JoinNodeRequest) -> Result<JoinNodeResponse, CuratorError> {
        let join_key = peer.transport_key().ok_or_else(|| {
            PermissionDeniedSnafu {
                message: "connection must be established with a certificate self-signed by the join key",
            }
            .build()
        })?;
        let id = match self.leadership.node_id_by_join_key(&join_key).await {
            Ok(id) => id,
            Err(CuratorError::NotFound { .. }) => {
                return PermissionDeniedSnafu {
                    message: "unknown join key",
                }
                .fail();
            }
            Err(e) => return Err(e),
        };
        let node = self.leadership.node_load(&id).await?;
        let cluster = self.leadership.cluster_load().await?;
        let sealed = request.using_sealed_configuration;

        match cluster.tpm_mode {
            TpmMode::Required => ensure!(
                sealed,
                PermissionDeniedSnafu {
                    message: "cluster requires a TPM-sealed configuration",
                }
            ),
            TpmMode::Disabled => ensure!(
                !sealed,
                PermissionDeniedSnafu {
                    message: "cluster does not allow TPM-sealed configurations",
                }
            ),
            TpmMode::BestEffort => {}
        }
        let uses_tpm = node.tpm_usage == TpmUsage::PresentAndUsed;
        ensure!(
            uses_tpm == sealed,
            PermissionDeniedSnafu {
                message: format!("node TPM usage {:?} does not match sealed configuration {sealed}", node.tpm_usage),
            }
        );
        ensure!(
            node.state == NodeState::Up,
            FailedPreconditionSnafu {
                message: format!("node is {}, expected UP", node.state),
            }
        );

        info!(node_id = %id, "node joined");
        Ok(JoinNodeResponse {
            cluster_unlock_key: node.cluster_unlock_key,
        })
    }
}
