//! The curator runnable: election, dispatcher and the implementation for
//! the current election status.

use std::sync::Arc;
use std::time::Duration;

use curator_kv::KeyValueStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::consensus::ConsensusAdmin;
use crate::election::ElectionConfig;
use crate::election::ElectionHandle;
use crate::election::ElectionStatus;
use crate::election::LeaderElection;
use crate::follower::Follower;
use crate::leader::Leader;
use crate::leader::LeaderSettings;
use crate::leadership::Leadership;
use crate::listener::Dispatcher;
use crate::listener::ImplementationFactory;
use crate::pki::PkiContext;
use crate::rpc::CuratorService;

/// Everything a curator needs to run.
pub struct Curator {
    pub node_id: String,
    pub store: Arc<dyn KeyValueStore>,
    pub pki: Arc<PkiContext>,
    pub consensus: Arc<ConsensusAdmin>,
    pub election: ElectionConfig,
    pub settings: LeaderSettings,
    pub reconcile_interval: Duration,
    pub dispatch_timeout: Duration,
}

impl Curator {
    /// Start campaigning and serving. Everything stops when `shutdown` fires
    /// or the handle is shut down.
    pub fn start(self, shutdown: CancellationToken) -> CuratorHandle {
        let election = LeaderElection::new(self.store.clone(), self.node_id.clone(), self.election).start();
        let status = election.subscribe();
        let factory = Arc::new(CuratorFactory {
            node_id: self.node_id,
            store: self.store,
            pki: self.pki,
            consensus: self.consensus,
            settings: self.settings,
            reconcile_interval: self.reconcile_interval,
        });
        let (dispatcher, dispatcher_task) =
            Dispatcher::spawn(status.clone(), factory, self.dispatch_timeout, shutdown.clone());
        CuratorHandle {
            election,
            status,
            dispatcher,
            dispatcher_task,
            shutdown,
        }
    }
}

struct CuratorFactory {
    node_id: String,
    store: Arc<dyn KeyValueStore>,
    pki: Arc<PkiContext>,
    consensus: Arc<ConsensusAdmin>,
    settings: LeaderSettings,
    reconcile_interval: Duration,
}

impl ImplementationFactory for CuratorFactory {
    fn build(&self, status: &ElectionStatus, token: &CancellationToken) -> Option<Arc<dyn CuratorService>> {
        match status {
            ElectionStatus::Unknown => None,
            ElectionStatus::Leader { lock_key, lock_rev } => {
                let leadership = Leadership::new(self.store.clone(), lock_key.clone(), *lock_rev, self.node_id.clone());
                let leader = Arc::new(Leader::new(
                    leadership,
                    self.pki.clone(),
                    self.consensus.clone(),
                    self.settings.clone(),
                ));
                tokio::spawn(leader.clone().run_reconciler(self.reconcile_interval, token.clone()));
                info!(node_id = %self.node_id, lock_rev, "serving as leader");
                Some(leader)
            }
            ElectionStatus::Follower { leader_id, .. } => {
                info!(node_id = %self.node_id, leader = %leader_id, "serving as follower");
                Some(Arc::new(Follower::new(
                    leader_id.clone(),
                    self.node_id.clone(),
                    self.store.clone(),
                    self.settings.curator_port,
                )))
            }
        }
    }
}

/// A running curator.
pub struct CuratorHandle {
    election: ElectionHandle,
    status: watch::Receiver<ElectionStatus>,
    dispatcher: Arc<Dispatcher>,
    dispatcher_task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl CuratorHandle {
    /// The service to expose; calls are routed to the current implementation.
    pub fn service(&self) -> Arc<dyn CuratorService> {
        self.dispatcher.clone()
    }

    pub fn status(&self) -> ElectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionStatus> {
        self.status.clone()
    }

    /// Stop serving, then give up leadership.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.dispatcher_task.await;
        self.election.stop().await;
        info!("curator stopped");
    }
}

#[cfg(test)]
mod tests {
    use curator_kv::MemoryMembership;
    use curator_kv::MemoryStore;

    use super::*;
    use crate::authz::Peer;
    use crate::election::wait_for;
    use crate::identity::node_id;
    use crate::networking::DEFAULT_CLUSTER_NETWORK;

    fn curator(store: Arc<MemoryStore>, id: &str) -> Curator {
        let pki = Arc::new(PkiContext::new());
        let membership = Arc::new(MemoryMembership::with_voter(id, Vec::new()));
        Curator {
            node_id: id.to_string(),
            store,
            pki: pki.clone(),
            consensus: Arc::new(ConsensusAdmin::new(membership, pki, 7834)),
            election: ElectionConfig {
                lease_ttl: Duration::from_secs(5),
                retry_delay: Duration::from_millis(50),
                max_retry_delay: Duration::from_millis(200),
            },
            settings: LeaderSettings {
                cluster_network: DEFAULT_CLUSTER_NETWORK.parse().unwrap(),
                curator_port: 7835,
            },
            reconcile_interval: Duration::from_secs(1),
            dispatch_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn single_curator_leads_and_serves() {
        let store = MemoryStore::new();
        let id = node_id(&[3u8; 32]);
        let handle = curator(store, &id).start(CancellationToken::new());

        let mut status = handle.subscribe();
        let settled = tokio::time::timeout(Duration::from_secs(5), wait_for(&mut status, ElectionStatus::is_leader))
            .await
            .unwrap();
        assert!(matches!(settled, ElectionStatus::Leader { lock_rev, .. } if lock_rev > 0));

        let peer = Peer::User {
            identity: "owner".into(),
        };
        let ticket = handle.service().get_register_ticket(peer).await.unwrap();
        assert_eq!(ticket.ticket.len(), 32);

        handle.shutdown().await;
    }
}
