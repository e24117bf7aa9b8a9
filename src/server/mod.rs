//! HTTP/JSON transport of the curator surface.
//!
//! Every method is a `POST` with a JSON body. Errors are returned as
//! [`ErrorBody`] with a status derived from their code. The node watch is
//! streamed as newline-delimited [`WatchFrame`]s.

mod auth;
mod router;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use auth::HeaderAuthenticator;
pub use auth::NODE_HEADER;
pub use auth::PeerAuthenticator;
pub use auth::TRANSPORT_KEY_HEADER;
pub use auth::USER_HEADER;
pub use router::router;

use crate::authz::AuthorizationPolicy;
use crate::error::Code;
use crate::error::CuratorError;
use crate::error::ErrorBody;
use crate::rpc::CuratorService;
use crate::rpc::WatchEvent;

/// Shared state of the HTTP handlers.
pub struct ServerState {
    pub service: Arc<dyn CuratorService>,
    pub authenticator: Arc<dyn PeerAuthenticator>,
    pub policy: AuthorizationPolicy,
}

impl ServerState {
    /// Serve `service` with header authentication and the default policy.
    pub fn new(service: Arc<dyn CuratorService>) -> Self {
        Self {
            service,
            authenticator: Arc::new(HeaderAuthenticator),
            policy: AuthorizationPolicy::default(),
        }
    }
}

/// One line of a watch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum WatchFrame {
    Event(WatchEvent),
    /// The watch failed; no further frames follow.
    Error(ErrorBody),
}

pub fn status_code(err: &CuratorError) -> StatusCode {
    if matches!(err, CuratorError::NotLeader { .. }) {
        return StatusCode::MISDIRECTED_REQUEST;
    }
    match err.code() {
        Code::InvalidArgument | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Aborted => StatusCode::CONFLICT,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CuratorError {
    fn into_response(self) -> Response {
        (status_code(&self), Json(ErrorBody::from(&self))).into_response()
    }
}

/// Serve the curator API on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "curator API listening");
    }
    axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
