use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use futures::StreamExt;
use futures::future;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::ServerState;
use super::WatchFrame;
use crate::authz::Method;
use crate::authz::Peer;
use crate::error::CuratorError;
use crate::error::ErrorBody;
use crate::error::InvalidArgumentSnafu;
use crate::rpc::*;
use crate::state::ClusterConfiguration;

type Shared = Arc<ServerState>;

pub fn router(state: Shared) -> Router {
    Router::new()
        .route("/curator/watch", post(watch))
        .route("/curator/issue-certificate", post(issue_certificate))
        .route("/curator/update-node-status", post(update_node_status))
        .route("/curator/update-node-cluster-networking", post(update_node_cluster_networking))
        .route("/curator/get-current-leader", post(get_current_leader))
        .route("/curator/register-node", post(register_node))
        .route("/curator/commit-node", post(commit_node))
        .route("/curator/join-node", post(join_node))
        .route("/management/get-register-ticket", post(get_register_ticket))
        .route("/management/get-cluster-info", post(get_cluster_info))
        .route("/management/get-nodes", post(get_nodes))
        .route("/management/approve-node", post(approve_node))
        .route("/management/update-node-roles", post(update_node_roles))
        .route("/management/update-node-labels", post(update_node_labels))
        .route("/management/delete-node", post(delete_node))
        .route("/management/configure-cluster", post(configure_cluster))
        .route("/aaa/escrow", post(escrow))
        .with_state(state)
}

fn authorize(state: &ServerState, headers: &HeaderMap, method: Method) -> Result<Peer, CuratorError> {
    let peer = state.authenticator.authenticate(headers)?;
    state.policy.check_permissions(&peer, method)?;
    debug!(?method, %peer, "authorized");
    Ok(peer)
}

/// Decode a JSON request body. An empty body is an empty object.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, CuratorError> {
    let body = if body.is_empty() { b"{}".as_slice() } else { body };
    serde_json::from_slice(body).map_err(|e| {
        InvalidArgumentSnafu {
            message: format!("invalid request body: {e}"),
        }
        .build()
    })
}

async fn unary<Req, Resp, F, Fut>(
    state: &ServerState,
    headers: &HeaderMap,
    method: Method,
    body: &[u8],
    call: F,
) -> Result<Json<Resp>, CuratorError>
where
    Req: DeserializeOwned,
    F: FnOnce(Arc<dyn CuratorService>, Peer, Req) -> Fut,
    Fut: Future<Output = Result<Resp, CuratorError>>,
{
    let peer = authorize(state, headers, method)?;
    let request = decode(body)?;
    call(state.service.clone(), peer, request).await.map(Json)
}

async fn watch(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Response, CuratorError> {
    let peer = authorize(&state, &headers, Method::Watch)?;
    let request: WatchRequest = decode(&body)?;
    let events = state.service.watch(peer, request).await?;

    let frames = events
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            let frame = match item {
                Ok(event) => WatchFrame::Event(event),
                Err(e) => {
                    *failed = true;
                    WatchFrame::Error(ErrorBody::from(&e))
                }
            };
            future::ready(Some(frame))
        })
        .map(|frame| {
            let mut line = serde_json::to_vec(&frame)?;
            line.push(b'\n');
            Ok::<_, serde_json::Error>(line)
        });
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(frames)).into_response())
}

async fn issue_certificate(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IssueCertificateResponse>, CuratorError> {
    unary(&state, &headers, Method::IssueCertificate, &body, |service, peer, request: IssueCertificateRequest| async move {
        service.issue_certificate(peer, request).await
    })
    .await
}

async fn update_node_status(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<()>, CuratorError> {
    unary(&state, &headers, Method::UpdateNodeStatus, &body, |service, peer, request: UpdateNodeStatusRequest| async move {
        service.update_node_status(peer, request).await
    })
    .await
}

async fn update_node_cluster_networking(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<()>, CuratorError> {
    unary(
        &state,
        &headers,
        Method::UpdateNodeClusterNetworking,
        &body,
        |service, peer, request: UpdateNodeClusterNetworkingRequest| async move {
            service.update_node_cluster_networking(peer, request).await
        },
    )
    .await
}

async fn get_current_leader(
    State(state): State<Shared>,
    headers: HeaderMap,
) -> Result<Json<GetCurrentLeaderResponse>, CuratorError> {
    let peer = authorize(&state, &headers, Method::GetCurrentLeader)?;
    state.service.get_current_leader(peer).await.map(Json)
}

async fn register_node(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RegisterNodeResponse>, CuratorError> {
    unary(&state, &headers, Method::RegisterNode, &body, |service, peer, request: RegisterNodeRequest| async move {
        service.register_node(peer, request).await
    })
    .await
}

async fn commit_node(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CommitNodeResponse>, CuratorError> {
    unary(&state, &headers, Method::CommitNode, &body, |service, peer, request: CommitNodeRequest| async move {
        service.commit_node(peer, request).await
    })
    .await
}

async fn join_node(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<JoinNodeResponse>, CuratorError> {
    unary(&state, &headers, Method::JoinNode, &body, |service, peer, request: JoinNodeRequest| async move {
        service.join_node(peer, request).await
    })
    .await
}

async fn get_register_ticket(
    State(state): State<Shared>,
    headers: HeaderMap,
) -> Result<Json<GetRegisterTicketResponse>, CuratorError> {
    let peer = authorize(&state, &headers, Method::GetRegisterTicket)?;
    state.service.get_register_ticket(peer).await.map(Json)
}

async fn get_cluster_info(
    State(state): State<Shared>,
    headers: HeaderMap,
) -> Result<Json<GetClusterInfoResponse>, CuratorError> {
    let peer = authorize(&state, &headers, Method::GetClusterInfo)?;
    state.service.get_cluster_info(peer).await.map(Json)
}

async fn get_nodes(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<GetNodesResponse>, CuratorError> {
    unary(&state, &headers, Method::GetNodes, &body, |service, peer, request: GetNodesRequest| async move {
        service.get_nodes(peer, request).await
    })
    .await
}

async fn approve_node(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<()>, CuratorError> {
    unary(&state, &headers, Method::ApproveNode, &body, |service, peer, request: ApproveNodeRequest| async move {
        service.approve_node(peer, request).await
    })
    .await
}

async fn update_node_roles(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<()>, CuratorError> {
    unary(&state, &headers, Method::UpdateNodeRoles, &body, |service, peer, request: UpdateNodeRolesRequest| async move {
        service.update_node_roles(peer, request).await
    })
    .await
}

async fn update_node_labels(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<()>, CuratorError> {
    unary(&state, &headers, Method::UpdateNodeLabels, &body, |service, peer, request: UpdateNodeLabelsRequest| async move {
        service.update_node_labels(peer, request).await
    })
    .await
}

async fn delete_node(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<()>, CuratorError> {
    unary(&state, &headers, Method::DeleteNode, &body, |service, peer, request: DeleteNodeRequest| async move {
        service.delete_node(peer, request).await
    })
    .await
}

async fn configure_cluster(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ClusterConfiguration>, CuratorError> {
    unary(&state, &headers, Method::ConfigureCluster, &body, |service, peer, request: ConfigureClusterRequest| async move {
        service.configure_cluster(peer, request).await
    })
    .await
}

async fn escrow(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Result<Json<EscrowResponse>, CuratorError> {
    unary(&state, &headers, Method::Escrow, &body, |service, peer, request: EscrowRequest| async move {
        service.escrow(peer, request).await
    })
    .await
}
