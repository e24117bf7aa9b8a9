//! Error model of the curator RPC surface.
//!
//! Every failure maps to a [`Code`] and a [`RetryHint`] which tell clients
//! whether and how to retry. Store and PKI errors keep their source.

use curator_kv::KeyValueStoreError;
use curator_kv::MembershipError;
use curator_pki::PkiError;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Status codes of the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    InvalidArgument,
    PermissionDenied,
    Unauthenticated,
    NotFound,
    FailedPrecondition,
    OutOfRange,
    Unavailable,
    Aborted,
    Unimplemented,
    Internal,
}

/// How a client should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    /// Retrying the same request will fail the same way.
    Never,
    /// Retry after a delay.
    WithBackoff,
    /// Re-read the affected state, then retry.
    AfterRefresh,
    /// Connect to the current leader and retry there.
    RedialLeader,
}

/// Proofs a caller can supply to pass an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proof {
    /// Reconnect presenting a self-signed certificate for the requested key.
    RefreshCertificate,
}

/// Errors returned by curator operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CuratorError {
    #[snafu(display("{message}"))]
    InvalidArgument { message: String },

    #[snafu(display("{message}"))]
    PermissionDenied { message: String },

    #[snafu(display("{message}"))]
    Unauthenticated { message: String },

    /// The caller must reconnect with additional proof of identity.
    #[snafu(display("proof required: {proofs:?}"))]
    ProofRequired { proofs: Vec<Proof> },

    #[snafu(display("{message}"))]
    NotFound { message: String },

    #[snafu(display("{message}"))]
    FailedPrecondition { message: String },

    #[snafu(display("{message}"))]
    OutOfRange { message: String },

    #[snafu(display("{message}"))]
    Unavailable { message: String },

    /// The election lock was taken over by another candidate.
    #[snafu(display("lost leadership"))]
    LostLeadership,

    /// The implementation serving the call was replaced mid-flight.
    #[snafu(display("curator backend switched, request can be retried"))]
    BackendSwitched,

    /// A guarded write lost against a concurrent change.
    #[snafu(display("{what} transaction failed, retry possible"))]
    Conflict { what: String },

    /// This curator is not the leader.
    #[snafu(display("curator is not the leader (leader: {})", leader.as_deref().unwrap_or("unknown")))]
    NotLeader { leader: Option<String> },

    #[snafu(display("{message}"))]
    Unimplemented { message: String },

    #[snafu(display("internal error: {message}"))]
    Internal { message: String },

    #[snafu(display("store error: {source}"))]
    Store { source: KeyValueStoreError },

    #[snafu(display("membership error: {source}"))]
    Membership { source: MembershipError },

    #[snafu(display("{source}"))]
    Pki { source: PkiError },

    /// A stored value could not be (de)serialized.
    #[snafu(display("invalid value at '{key}': {source}"))]
    Codec { key: String, source: serde_json::Error },
}

impl From<KeyValueStoreError> for CuratorError {
    fn from(source: KeyValueStoreError) -> Self {
        CuratorError::Store { source }
    }
}

impl From<PkiError> for CuratorError {
    fn from(source: PkiError) -> Self {
        CuratorError::Pki { source }
    }
}

impl From<MembershipError> for CuratorError {
    fn from(source: MembershipError) -> Self {
        CuratorError::Membership { source }
    }
}

impl CuratorError {
    pub fn code(&self) -> Code {
        match self {
            CuratorError::InvalidArgument { .. } => Code::InvalidArgument,
            CuratorError::PermissionDenied { .. } => Code::PermissionDenied,
            CuratorError::Unauthenticated { .. } | CuratorError::ProofRequired { .. } => Code::Unauthenticated,
            CuratorError::NotFound { .. } => Code::NotFound,
            CuratorError::FailedPrecondition { .. } => Code::FailedPrecondition,
            CuratorError::OutOfRange { .. } => Code::OutOfRange,
            CuratorError::Unavailable { .. } | CuratorError::LostLeadership | CuratorError::BackendSwitched => {
                Code::Unavailable
            }
            CuratorError::Conflict { .. } => Code::Aborted,
            CuratorError::NotLeader { .. } | CuratorError::Unimplemented { .. } => Code::Unimplemented,
            CuratorError::Internal { .. } | CuratorError::Codec { .. } => Code::Internal,
            CuratorError::Store { source } => {
                if source.is_transient() {
                    Code::Unavailable
                } else {
                    Code::Internal
                }
            }
            CuratorError::Membership { source } => match source {
                MembershipError::MemberNotFound { .. } => Code::NotFound,
                MembershipError::Unavailable { .. } => Code::Unavailable,
                MembershipError::MemberExists { .. }
                | MembershipError::NotLearner { .. }
                | MembershipError::LastVoter { .. } => Code::FailedPrecondition,
            },
            CuratorError::Pki { source } => match source {
                PkiError::HostnameNotFound { .. } => Code::NotFound,
                PkiError::PublicKeyMismatch { .. } => Code::FailedPrecondition,
                PkiError::CrlConflict => Code::Aborted,
                PkiError::EmptyName { .. } | PkiError::InvalidPublicKey { .. } => Code::InvalidArgument,
                PkiError::Store { source } if source.is_transient() => Code::Unavailable,
                _ => Code::Internal,
            },
        }
    }

    pub fn retry_hint(&self) -> RetryHint {
        if matches!(self, CuratorError::NotLeader { .. }) {
            return RetryHint::RedialLeader;
        }
        match self.code() {
            Code::Unavailable => RetryHint::WithBackoff,
            Code::Aborted => RetryHint::AfterRefresh,
            _ => RetryHint::Never,
        }
    }

    /// Whether the operation failed because this process stopped leading.
    pub fn is_leadership_loss(&self) -> bool {
        matches!(self, CuratorError::LostLeadership | CuratorError::BackendSwitched)
    }
}

/// Wire form of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: Code,
    pub message: String,
    pub retry: RetryHint,
    /// Current leader, for [`RetryHint::RedialLeader`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proofs: Vec<Proof>,
}

impl From<&CuratorError> for ErrorBody {
    fn from(err: &CuratorError) -> Self {
        let leader = match err {
            CuratorError::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        let proofs = match err {
            CuratorError::ProofRequired { proofs } => proofs.clone(),
            _ => Vec::new(),
        };
        ErrorBody {
            code: err.code(),
            message: err.to_string(),
            retry: err.retry_hint(),
            leader,
            proofs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_errors_are_retried_with_backoff() {
        for err in [CuratorError::LostLeadership, CuratorError::BackendSwitched] {
            assert_eq!(err.code(), Code::Unavailable);
            assert_eq!(err.retry_hint(), RetryHint::WithBackoff);
        }
        assert_eq!(
            CuratorError::BackendSwitched.to_string(),
            "curator backend switched, request can be retried"
        );
    }

    #[test]
    fn conflict_is_aborted_and_refreshed() {
        let err = ConflictSnafu { what: "node save" }.build();
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(err.retry_hint(), RetryHint::AfterRefresh);
        assert_eq!(err.to_string(), "node save transaction failed, retry possible");
    }

    #[test]
    fn not_leader_redials() {
        let err = CuratorError::NotLeader {
            leader: Some("node-aa".into()),
        };
        assert_eq!(err.code(), Code::Unimplemented);
        let body = ErrorBody::from(&err);
        assert_eq!(body.retry, RetryHint::RedialLeader);
        assert_eq!(body.leader.as_deref(), Some("node-aa"));
    }

    #[test]
    fn store_errors_map_by_kind() {
        let transient = CuratorError::from(KeyValueStoreError::Unavailable { reason: "down".into() });
        assert_eq!(transient.code(), Code::Unavailable);
        let fatal = CuratorError::from(KeyValueStoreError::EmptyKey);
        assert_eq!(fatal.code(), Code::Internal);
        assert_eq!(fatal.retry_hint(), RetryHint::Never);
    }

    #[test]
    fn pki_errors_map_by_kind() {
        let missing = CuratorError::from(PkiError::HostnameNotFound { hostname: "x".into() });
        assert_eq!(missing.code(), Code::NotFound);
        let mismatch = CuratorError::from(PkiError::PublicKeyMismatch { name: "x".into() });
        assert_eq!(mismatch.code(), Code::FailedPrecondition);
        let conflict = CuratorError::from(PkiError::CrlConflict);
        assert_eq!(conflict.retry_hint(), RetryHint::AfterRefresh);
    }

    #[test]
    fn proof_required_is_unauthenticated() {
        let err = CuratorError::ProofRequired {
            proofs: vec![Proof::RefreshCertificate],
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, Code::Unauthenticated);
        assert_eq!(body.proofs, vec![Proof::RefreshCertificate]);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "unauthenticated");
        assert_eq!(json["retry"], "never");
    }
}
