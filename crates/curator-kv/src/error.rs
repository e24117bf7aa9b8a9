//! Error types for store operations.

use thiserror::Error;

use crate::persistent::StorageError;
use crate::types::LeaseId;

/// Errors returned by [`KeyValueStore`](crate::KeyValueStore) implementations.
#[derive(Debug, Error)]
pub enum KeyValueStoreError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("lease {lease} not found or expired")]
    LeaseNotFound { lease: LeaseId },
    #[error("revision {requested} has been compacted (oldest retained: {compacted})")]
    Compacted { requested: u64, compacted: u64 },
    #[error("watch fell behind by {skipped} updates")]
    WatchLagged { skipped: u64 },
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("operation failed: {reason}")]
    Failed { reason: String },
    #[error("storage failure: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },
}

impl KeyValueStoreError {
    /// Whether retrying the same request may succeed without any change in state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::WatchLagged { .. })
    }
}

/// Errors returned by [`ConsensusMembership`](crate::ConsensusMembership) implementations.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("member {id:x} not found")]
    MemberNotFound { id: u64 },
    #[error("member with name '{name}' already exists")]
    MemberExists { name: String },
    #[error("member {id:x} is not a learner")]
    NotLearner { id: u64 },
    #[error("removing member {id:x} would leave the cluster without voters")]
    LastVoter { id: u64 },
    #[error("membership unavailable: {reason}")]
    Unavailable { reason: String },
}
