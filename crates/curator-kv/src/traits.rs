//! Core traits for the replicated log.
//!
//! The curator never talks to a consensus engine directly. Everything it
//! needs is expressed as a conditional transaction store with watches and
//! leases, plus a membership controller for the log itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::KeyValueStoreError;
use crate::error::MembershipError;
use crate::types::KeyValue;
use crate::types::LeaseId;
use crate::types::Member;
use crate::types::TxnOp;
use crate::types::TxnRequest;
use crate::types::TxnResponse;
use crate::types::WatchRequest;
use crate::types::WatchStream;

/// A key-value store with atomic conditional transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Evaluate `request.compare`; run the success branch if all hold, the failure branch otherwise.
    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, KeyValueStoreError>;

    /// Stream changes to the keys selected by `request`.
    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError>;

    /// Grant a lease that expires unless kept alive within `ttl`.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KeyValueStoreError>;

    /// Refresh a lease, returning its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KeyValueStoreError>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KeyValueStoreError>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KeyValueStoreError> {
        let response = self.txn(TxnRequest::new().then([TxnOp::get(key)])).await?;
        Ok(response.kv(0).cloned())
    }

    async fn range(&self, bounds: (String, String)) -> Result<Vec<KeyValue>, KeyValueStoreError> {
        let response = self.txn(TxnRequest::new().then([TxnOp::range(bounds)])).await?;
        Ok(response.kvs(0).to_vec())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KeyValueStoreError> {
        let response = self.txn(TxnRequest::new().then([TxnOp::put(key, value)])).await?;
        Ok(response.revision)
    }
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, KeyValueStoreError> {
        (**self).txn(request).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        (**self).watch(request).await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KeyValueStoreError> {
        (**self).grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KeyValueStoreError> {
        (**self).keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KeyValueStoreError> {
        (**self).revoke_lease(lease).await
    }
}

/// Membership control of the replicated log.
#[async_trait]
pub trait ConsensusMembership: Send + Sync {
    async fn member_list(&self) -> Result<Vec<Member>, MembershipError>;

    /// Add a non-voting learner which will be promoted once caught up.
    async fn member_add_learner(&self, name: &str, peer_urls: Vec<String>) -> Result<Member, MembershipError>;

    async fn member_promote(&self, id: u64) -> Result<(), MembershipError>;

    async fn member_remove(&self, id: u64) -> Result<(), MembershipError>;
}

#[async_trait]
impl<T: ConsensusMembership + ?Sized> ConsensusMembership for Arc<T> {
    async fn member_list(&self) -> Result<Vec<Member>, MembershipError> {
        (**self).member_list().await
    }

    async fn member_add_learner(&self, name: &str, peer_urls: Vec<String>) -> Result<Member, MembershipError> {
        (**self).member_add_learner(name, peer_urls).await
    }

    async fn member_promote(&self, id: u64) -> Result<(), MembershipError> {
        (**self).member_promote(id).await
    }

    async fn member_remove(&self, id: u64) -> Result<(), MembershipError> {
        (**self).member_remove(id).await
    }
}
