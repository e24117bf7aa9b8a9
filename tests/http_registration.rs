//! Node registration through the HTTP surface of a running curator.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use curator::Curator;
use curator::CuratorHandle;
use curator::bootstrap::BootstrapParams;
use curator::bootstrap::bootstrap_cluster;
use curator::consensus::ConsensusAdmin;
use curator::election::ElectionConfig;
use curator::election::ElectionStatus;
use curator::election::wait_for;
use curator::error::Code;
use curator::error::ErrorBody;
use curator::identity::node_id;
use curator::labels::Label;
use curator::leader::LeaderSettings;
use curator::networking::DEFAULT_CLUSTER_NETWORK;
use curator::pki::PkiContext;
use curator::rpc::*;
use curator::server::NODE_HEADER;
use curator::server::ServerState;
use curator::server::TRANSPORT_KEY_HEADER;
use curator::server::USER_HEADER;
use curator::server::router;
use curator::state::ClusterConfiguration;
use curator::state::NodeState;
use curator::state::StorageSecurity;
use curator::state::TpmMode;
use curator::state::TpmUsage;
use curator_kv::MemoryMembership;
use curator_kv::MemoryStore;
use curator_pki::verify;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const LEADER_KEY: [u8; 32] = [0x11; 32];
const NEW_NODE_KEY: [u8; 32] = [0x61; 32];
const NEW_NODE_JOIN_KEY: [u8; 32] = [0x62; 32];

async fn start() -> CuratorHandle {
    let store = MemoryStore::new();
    let pki = Arc::new(PkiContext::new());
    let id = node_id(&LEADER_KEY);
    let membership = Arc::new(MemoryMembership::with_voter(id.clone(), vec!["https://10.0.0.1:7834".into()]));
    let consensus = Arc::new(ConsensusAdmin::new(membership, pki.clone(), 7834));
    let params = BootstrapParams {
        initial_owner: None,
        cluster_configuration: ClusterConfiguration {
            tpm_mode: TpmMode::Disabled,
            ..ClusterConfiguration::default()
        },
        tpm_usage: TpmUsage::NotPresent,
        cluster_unlock_key: vec![1u8; 32],
        external_address: Some("10.0.0.1".into()),
    };
    bootstrap_cluster(&*store, &consensus, &pki, LEADER_KEY, [0x12; 32], params).await.unwrap();

    let handle = Curator {
        node_id: id,
        store,
        pki,
        consensus,
        election: ElectionConfig {
            lease_ttl: Duration::from_secs(5),
            retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(200),
        },
        settings: LeaderSettings {
            cluster_network: DEFAULT_CLUSTER_NETWORK.parse().unwrap(),
            curator_port: 7835,
        },
        reconcile_interval: Duration::from_millis(500),
        dispatch_timeout: Duration::from_secs(5),
    }
    .start(CancellationToken::new());

    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), wait_for(&mut status, ElectionStatus::is_leader))
        .await
        .unwrap();
    handle
}

async fn call<T: DeserializeOwned>(
    app: &Router,
    uri: &str,
    header: (&str, String),
    body: &impl Serialize,
) -> Result<T, (StatusCode, ErrorBody)> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header.0, header.1)
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    if status.is_success() {
        Ok(serde_json::from_slice(&bytes).unwrap())
    } else {
        Err((status, serde_json::from_slice(&bytes).unwrap()))
    }
}

fn owner() -> (&'static str, String) {
    (USER_HEADER, "owner".into())
}

fn self_signed() -> (&'static str, String) {
    (TRANSPORT_KEY_HEADER, hex::encode(NEW_NODE_KEY))
}

#[tokio::test]
async fn node_registers_commits_and_finds_leader() {
    let handle = start().await;
    let app = router(Arc::new(ServerState::new(handle.service())));

    let ticket: GetRegisterTicketResponse =
        call(&app, "/management/get-register-ticket", owner(), &serde_json::json!({})).await.unwrap();

    let register = RegisterNodeRequest {
        register_ticket: ticket.ticket.clone(),
        join_key: NEW_NODE_JOIN_KEY.to_vec(),
        have_local_tpm: false,
        labels: vec![Label {
            key: "topology.example.com/zone".into(),
            value: "a".into(),
        }],
    };
    let registered: RegisterNodeResponse =
        call(&app, "/curator/register-node", self_signed(), &register).await.unwrap();
    assert_eq!(registered.tpm_usage, TpmUsage::NotPresent);
    assert_eq!(registered.recommended_storage_security, StorageSecurity::AuthenticatedEncrypted);

    let commit = CommitNodeRequest {
        storage_security: StorageSecurity::AuthenticatedEncrypted,
        cluster_unlock_key: vec![9u8; 32],
    };
    let (status, err) = call::<CommitNodeResponse>(&app, "/curator/commit-node", self_signed(), &commit)
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err.code, Code::PermissionDenied);

    let approve = ApproveNodeRequest {
        public_key: NEW_NODE_KEY.to_vec(),
    };
    call::<()>(&app, "/management/approve-node", owner(), &approve).await.unwrap();

    let committed: CommitNodeResponse = call(&app, "/curator/commit-node", self_signed(), &commit).await.unwrap();
    verify::verify_signed_by(&committed.node_certificate, &committed.ca_certificate).unwrap();
    assert_eq!(verify::public_key(&committed.node_certificate).unwrap(), NEW_NODE_KEY);

    let nodes: GetNodesResponse =
        call(&app, "/management/get-nodes", owner(), &GetNodesRequest { state: Some(NodeState::Up) }).await.unwrap();
    let new_node = nodes.nodes.iter().find(|n| n.public_key == NEW_NODE_KEY).unwrap();
    assert_eq!(new_node.labels.len(), 1);
    assert_eq!(nodes.nodes.len(), 2);

    let node = (NODE_HEADER, hex::encode(NEW_NODE_KEY));
    let leader: GetCurrentLeaderResponse =
        call(&app, "/curator/get-current-leader", node, &serde_json::json!({})).await.unwrap();
    assert_eq!(leader.leader_node_id, node_id(&LEADER_KEY));
    assert_eq!(leader.leader_host, "10.0.0.1");
    assert_eq!(leader.leader_port, 7835);

    let join_key = (TRANSPORT_KEY_HEADER, hex::encode(NEW_NODE_JOIN_KEY));
    let joined: JoinNodeResponse = call(
        &app,
        "/curator/join-node",
        join_key,
        &JoinNodeRequest {
            using_sealed_configuration: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(joined.cluster_unlock_key, vec![9u8; 32]);

    handle.shutdown().await;
}

#[tokio::test]
async fn wrong_ticket_is_rejected() {
    let handle = start().await;
    let app = router(Arc::new(ServerState::new(handle.service())));

    let register = RegisterNodeRequest {
        register_ticket: vec![0u8; 32],
        join_key: NEW_NODE_JOIN_KEY.to_vec(),
        have_local_tpm: false,
        labels: Vec::new(),
    };
    let (status, err) = call::<RegisterNodeResponse>(&app, "/curator/register-node", self_signed(), &register)
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err.code, Code::PermissionDenied);

    handle.shutdown().await;
}
