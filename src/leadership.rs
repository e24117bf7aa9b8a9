//! Fenced access to the store.
//!
//! A leader holds the election key `lock_key` created at revision
//! `lock_rev`. Every write it performs is guarded by
//! `CreateRevision(lock_key) == lock_rev`, so a leader that was replaced
//! can never overwrite state written by its successor.

use std::sync::Arc;

use curator_kv::Compare;
use curator_kv::CompareOp;
use curator_kv::KeyValueStore;
use curator_kv::TxnOp;
use curator_kv::TxnRequest;
use curator_kv::TxnResponse;
use snafu::ResultExt;
use tracing::warn;

use crate::error::ConflictSnafu;
use crate::error::CuratorError;
use crate::error::StoreSnafu;

/// Proof of leadership for one election term.
#[derive(Clone)]
pub struct Leadership {
    store: Arc<dyn KeyValueStore>,
    lock_key: String,
    lock_rev: u64,
    node_id: String,
}

impl Leadership {
    pub fn new(store: Arc<dyn KeyValueStore>, lock_key: impl Into<String>, lock_rev: u64, node_id: impl Into<String>) -> Self {
        Self {
            store,
            lock_key: lock_key.into(),
            lock_rev,
            node_id: node_id.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn lock_rev(&self) -> u64 {
        self.lock_rev
    }

    /// ID of the local (leading) node.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run `ops` atomically, only if this process still holds leadership.
    pub async fn txn_as_leader(&self, ops: impl IntoIterator<Item = TxnOp>) -> Result<TxnResponse, CuratorError> {
        self.txn_as_leader_if(Vec::new(), ops).await
    }

    /// Like [`Leadership::txn_as_leader`] with additional compares.
    ///
    /// If the lock still holds but one of `compares` fails, the result is
    /// [`CuratorError::Conflict`].
    pub async fn txn_as_leader_if(
        &self,
        compares: impl IntoIterator<Item = Compare>,
        ops: impl IntoIterator<Item = TxnOp>,
    ) -> Result<TxnResponse, CuratorError> {
        let request = TxnRequest::new()
            .when([Compare::create_revision(self.lock_key.as_str(), CompareOp::Equal, self.lock_rev)])
            .when(compares)
            .then(ops)
            .or_else([TxnOp::get(self.lock_key.as_str())]);
        let response = self.store.txn(request).await.context(StoreSnafu)?;
        if response.succeeded {
            return Ok(response);
        }

        let current = response.kv(0).map(|kv| kv.create_revision).unwrap_or(0);
        if current == self.lock_rev {
            return ConflictSnafu { what: "guarded" }.fail();
        }
        warn!(
            lock_key = %self.lock_key,
            lock_rev = self.lock_rev,
            current_rev = current,
            "leadership fencing check failed"
        );
        Err(CuratorError::LostLeadership)
    }
}
