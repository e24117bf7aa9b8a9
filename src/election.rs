//! Lease-based leader election.
//!
//! Every candidate writes a campaign key `/leader/<lease id>` attached to its
//! own lease. The candidate whose key has the lowest CreateRevision leads,
//! and that revision is its fencing token. Everyone else follows the
//! holder of that key until it disappears.
//!
//! ```ignore
//! let handle = LeaderElection::new(store, node_id, ElectionConfig::default()).start();
//! let mut status = handle.subscribe();
//! while status.changed().await.is_ok() {
//!     if let ElectionStatus::Leader { lock_rev, .. } = &*status.borrow() {
//!         println!("leading with token {lock_rev}");
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use curator_kv::Compare;
use curator_kv::CompareOp;
use curator_kv::EventKind;
use curator_kv::KeyValue;
use curator_kv::KeyValueStore;
use curator_kv::KeyspacePrefix;
use curator_kv::LeaseId;
use curator_kv::TxnOp;
use curator_kv::TxnRequest;
use curator_kv::WatchRequest;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CodecSnafu;
use crate::error::CuratorError;
use crate::error::InternalSnafu;
use crate::error::StoreSnafu;
use crate::error::UnavailableSnafu;

pub const ELECTION_PREFIX: KeyspacePrefix = KeyspacePrefix::from_static("/leader/");

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// TTL of the campaign lease. It is refreshed every third of this.
    pub lease_ttl: Duration,
    /// Delay before campaigning again after a failed round.
    pub retry_delay: Duration,
    /// Upper bound of the exponential retry backoff.
    pub max_retry_delay: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// The local view of the election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionStatus {
    /// Not campaigning, or between rounds.
    Unknown,
    /// Another node leads.
    Follower { leader_id: String, ttl: Duration },
    /// This node leads. `lock_rev` is the fencing token.
    Leader { lock_key: String, lock_rev: u64 },
}

impl ElectionStatus {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionStatus::Leader { .. })
    }
}

/// Value of a campaign key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Candidacy {
    node_id: String,
    ttl_secs: u64,
}

pub struct LeaderElection {
    store: Arc<dyn KeyValueStore>,
    node_id: String,
    config: ElectionConfig,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn KeyValueStore>, node_id: impl Into<String>, config: ElectionConfig) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            config,
        }
    }

    /// Campaign in the background until the returned handle is stopped.
    pub fn start(self) -> ElectionHandle {
        let (status_tx, status_rx) = watch::channel(ElectionStatus::Unknown);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(status_tx, cancel.clone()));
        ElectionHandle {
            status_rx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(self, status: watch::Sender<ElectionStatus>, cancel: CancellationToken) {
        let mut backoff = self.config.retry_delay;
        while !cancel.is_cancelled() {
            let result = self.campaign(&status, &cancel).await;
            let was_settled = *status.borrow() != ElectionStatus::Unknown;
            publish(&status, ElectionStatus::Unknown);
            match result {
                Ok(()) => break,
                Err(e) => warn!(node_id = %self.node_id, error = %e, "election round failed"),
            }

            if was_settled {
                backoff = self.config.retry_delay;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_retry_delay);
        }
        debug!(node_id = %self.node_id, "election stopped");
    }

    /// Delete campaign keys left behind by a previous lifetime of this node.
    async fn cleanup_stale(&self) -> Result<(), CuratorError> {
        let existing = self.store.range(ELECTION_PREFIX.range()).await.context(StoreSnafu)?;
        for kv in existing {
            let Ok(candidacy) = serde_json::from_slice::<Candidacy>(&kv.value) else {
                continue;
            };
            if candidacy.node_id != self.node_id {
                continue;
            }
            let response = self
                .store
                .txn(
                    TxnRequest::new()
                        .when([Compare::mod_revision(kv.key.as_str(), CompareOp::Equal, kv.mod_revision)])
                        .then([TxnOp::delete(kv.key.as_str())]),
                )
                .await
                .context(StoreSnafu)?;
            if response.succeeded {
                info!(node_id = %self.node_id, key = %kv.key, "removed stale election key");
            }
        }
        Ok(())
    }

    /// One round: campaign, then follow or lead until the lease is lost.
    ///
    /// Returns `Ok` only when cancelled.
    async fn campaign(&self, status: &watch::Sender<ElectionStatus>, cancel: &CancellationToken) -> Result<(), CuratorError> {
        self.cleanup_stale().await?;

        let lease = self.store.grant_lease(self.config.lease_ttl).await.context(StoreSnafu)?;
        let result = self.hold_lease(lease, status, cancel).await;
        if let Err(e) = self.store.revoke_lease(lease).await {
            debug!(lease = %lease, error = %e, "could not revoke election lease");
        }
        result
    }

    async fn hold_lease(
        &self,
        lease: LeaseId,
        status: &watch::Sender<ElectionStatus>,
        cancel: &CancellationToken,
    ) -> Result<(), CuratorError> {
        let key = ELECTION_PREFIX.key(&lease.to_string()).map_err(|e| {
            InternalSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        let candidacy = Candidacy {
            node_id: self.node_id.clone(),
            ttl_secs: self.config.lease_ttl.as_secs(),
        };
        let value = serde_json::to_vec(&candidacy).context(CodecSnafu { key: key.clone() })?;
        let created = self
            .store
            .txn(
                TxnRequest::new()
                    .when([Compare::absent(key.as_str())])
                    .then([TxnOp::put_with_lease(key.as_str(), value, lease)]),
            )
            .await
            .context(StoreSnafu)?;
        if !created.succeeded {
            return UnavailableSnafu {
                message: format!("campaign key {key} already exists"),
            }
            .fail();
        }
        let lock_rev = created.revision;
        debug!(node_id = %self.node_id, key = %key, lock_rev, "campaigning");

        let mut keepalive = tokio::time::interval(self.config.lease_ttl / 3);
        keepalive.tick().await;

        let mut revision = self.evaluate(&key, lock_rev, status).await?;
        let mut changes =
            self.store.watch(WatchRequest::range(ELECTION_PREFIX.range()).from_revision(revision + 1)).await.context(StoreSnafu)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = keepalive.tick() => {
                    self.store.keep_alive(lease).await.context(StoreSnafu)?;
                }
                change = changes.next() => {
                    let response = match change {
                        Some(response) => response.context(StoreSnafu)?,
                        None => return UnavailableSnafu { message: "election watch closed" }.fail(),
                    };
                    let lost = response.events.iter().any(|e| e.kind == EventKind::Delete && e.kv.key == key);
                    if lost {
                        info!(node_id = %self.node_id, key = %key, "election key deleted, lease lost");
                        return UnavailableSnafu { message: "election lease lost" }.fail();
                    }
                    if response.revision > revision {
                        revision = self.evaluate(&key, lock_rev, status).await?;
                    }
                }
            }
        }
    }

    /// Publish the status implied by the current set of campaign keys.
    async fn evaluate(&self, key: &str, lock_rev: u64, status: &watch::Sender<ElectionStatus>) -> Result<u64, CuratorError> {
        let response = self.store.txn(TxnRequest::new().then([TxnOp::range(ELECTION_PREFIX.range())])).await.context(StoreSnafu)?;
        let holder: Option<&KeyValue> = response.kvs(0).iter().min_by_key(|kv| kv.create_revision);
        let Some(holder) = holder else {
            return UnavailableSnafu {
                message: "own election key missing",
            }
            .fail();
        };

        if holder.key == key {
            if !status.borrow().is_leader() {
                info!(node_id = %self.node_id, lock_key = %key, lock_rev, "became leader");
            }
            publish(
                status,
                ElectionStatus::Leader {
                    lock_key: key.to_string(),
                    lock_rev,
                },
            );
        } else {
            let candidacy: Candidacy = serde_json::from_slice(&holder.value).context(CodecSnafu {
                key: holder.key.clone(),
            })?;
            debug!(node_id = %self.node_id, leader = %candidacy.node_id, "following");
            publish(
                status,
                ElectionStatus::Follower {
                    leader_id: candidacy.node_id,
                    ttl: Duration::from_secs(candidacy.ttl_secs),
                },
            );
        }
        Ok(response.revision)
    }
}

fn publish(status: &watch::Sender<ElectionStatus>, next: ElectionStatus) {
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Handle to a running election.
pub struct ElectionHandle {
    status_rx: watch::Receiver<ElectionStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ElectionHandle {
    pub fn subscribe(&self) -> watch::Receiver<ElectionStatus> {
        self.status_rx.clone()
    }

    pub fn status(&self) -> ElectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Stop campaigning and give up the lease.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait until `status` satisfies `predicate`.
pub async fn wait_for(
    status: &mut watch::Receiver<ElectionStatus>,
    predicate: impl Fn(&ElectionStatus) -> bool,
) -> ElectionStatus {
    loop {
        let current = status.borrow_and_update().clone();
        if predicate(&current) {
            return current;
        }
        if status.changed().await.is_err() {
            return status.borrow().clone();
        }
    }
}
