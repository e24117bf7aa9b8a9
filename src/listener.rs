//! Routing of RPCs to the implementation matching the election status.
//!
//! The [`Dispatcher`] follows the election status and keeps exactly one
//! implementation active: a leader, a follower, or none while the status is
//! unknown. Each implementation owns a [`CancellationToken`]. Switching
//! cancels the previous token, which fails all calls still running against
//! it with [`CuratorError::BackendSwitched`] and terminates its watch streams.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::authz::Peer;
use crate::election::ElectionStatus;
use crate::error::CuratorError;
use crate::error::UnavailableSnafu;
use crate::rpc::*;
use crate::state::ClusterConfiguration;

/// Builds the implementation serving a given election status.
pub trait ImplementationFactory: Send + Sync + 'static {
    /// `token` is cancelled once the implementation is replaced. Background
    /// work belonging to the implementation must stop with it.
    fn build(&self, status: &ElectionStatus, token: &CancellationToken) -> Option<Arc<dyn CuratorService>>;
}

#[derive(Clone)]
struct Active {
    service: Arc<dyn CuratorService>,
    token: CancellationToken,
}

pub struct Dispatcher {
    active: watch::Receiver<Option<Active>>,
    timeout: Duration,
}

impl Dispatcher {
    /// Start following `status`. The returned task ends when `shutdown` fires
    /// or the status sender goes away.
    pub fn spawn(
        mut status: watch::Receiver<ElectionStatus>,
        factory: Arc<dyn ImplementationFactory>,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (active_tx, active_rx) = watch::channel(None::<Active>);
        let task = tokio::spawn(async move {
            let mut current: Option<CancellationToken> = None;
            loop {
                let next = status.borrow_and_update().clone();
                if let Some(previous) = current.take() {
                    previous.cancel();
                }
                let token = shutdown.child_token();
                let service = factory.build(&next, &token);
                info!(status = ?next, serving = service.is_some(), "curator implementation switched");
                active_tx.send_replace(service.map(|service| Active {
                    service,
                    token: token.clone(),
                }));
                current = Some(token);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            if let Some(token) = current {
                token.cancel();
            }
            active_tx.send_replace(None);
            debug!("dispatcher stopped");
        });

        let dispatcher = Arc::new(Self {
            active: active_rx,
            timeout,
        });
        (dispatcher, task)
    }

    /// Wait for an implementation, up to the dispatch timeout.
    async fn acquire(&self) -> Result<Active, CuratorError> {
        let mut active = self.active.clone();
        let ready = active.wait_for(|a| a.as_ref().is_some_and(|a| !a.token.is_cancelled()));
        let found = match tokio::time::timeout(self.timeout, ready).await {
            Ok(Ok(found)) => found.clone(),
            Ok(Err(_)) => {
                return UnavailableSnafu {
                    message: "curator is shutting down",
                }
                .fail();
            }
            Err(_) => {
                return UnavailableSnafu {
                    message: format!("no curator implementation available after {:?}", self.timeout),
                }
                .fail();
            }
        };
        found.ok_or(CuratorError::BackendSwitched)
    }

    async fn call<T, F, Fut>(&self, f: F) -> Result<T, CuratorError>
    where
        F: FnOnce(Arc<dyn CuratorService>) -> Fut + Send,
        Fut: Future<Output = Result<T, CuratorError>> + Send,
    {
        let active = self.acquire().await?;
        let token = active.token;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CuratorError::BackendSwitched),
            result = f(active.service) => result,
        }
    }
}

/// End `stream` once `token` fires, with a final [`CuratorError::BackendSwitched`].
fn until_switched(stream: NodeWatchStream, token: CancellationToken) -> NodeWatchStream {
    let switched = token.clone();
    let tail = futures::stream::once(async move { switched.is_cancelled() })
        .filter_map(|cancelled| async move { cancelled.then_some(Err(CuratorError::BackendSwitched)) });
    stream.take_until(token.cancelled_owned()).chain(tail).boxed()
}

#[async_trait]
impl CuratorService for Dispatcher {
    async fn watch(&self, peer: Peer, request: WatchRequest) -> Result<NodeWatchStream, CuratorError> {
        let active = self.acquire().await?;
        let token = active.token.clone();
        let stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CuratorError::BackendSwitched),
            stream = active.service.watch(peer, request) => stream?,
        };
        Ok(until_switched(stream, token))
    }

    async fn issue_certificate(
        &self,
        peer: Peer,
        request: IssueCertificateRequest,
    ) -> Result<IssueCertificateResponse, CuratorError> {
        self.call(move |s| async move { s.issue_certificate(peer, request).await }).await
    }

    async fn update_node_status(&self, peer: Peer, request: UpdateNodeStatusRequest) -> Result<(), CuratorError> {
        self.call(move |s| async move { s.update_node_status(peer, request).await }).await
    }

    async fn update_node_cluster_networking(
        &self,
        peer: Peer,
        request: UpdateNodeClusterNetworkingRequest,
    ) -> Result<(), CuratorError> {
        self.call(move |s| async move { s.update_node_cluster_networking(peer, request).await }).await
    }

    async fn get_current_leader(&self, peer: Peer) -> Result<GetCurrentLeaderResponse, CuratorError> {
        self.call(move |s| async move { s.get_current_leader(peer).await }).await
    }

    async fn register_node(&self, peer: Peer, request: RegisterNodeRequest) -> Result<RegisterNodeResponse, CuratorError> {
        self.call(move |s| async move { s.register_node(peer, request).await }).await
    }

    async fn commit_node(&self, peer: Peer, request: CommitNodeRequest) -> Result<CommitNodeResponse, CuratorError> {
        self.call(move |s| async move { s.commit_node(peer, request).await }).await
    }

    async fn join_node(&self, peer: Peer, request: JoinNodeRequest) -> Result<JoinNodeResponse, CuratorError> {
        self.call(move |s| async move { s.join_node(peer, request).await }).await
    }

    async fn get_register_ticket(&self, peer: Peer) -> Result<GetRegisterTicketResponse, CuratorError> {
        self.call(move |s| async move { s.get_register_ticket(peer).await }).await
    }

    async fn get_cluster_info(&self, peer: Peer) -> Result<GetClusterInfoResponse, CuratorError> {
        self.call(move |s| async move { s.get_cluster_info(peer).await }).await
    }

    async fn get_nodes(&self, peer: Peer, request: GetNodesRequest) -> Result<GetNodesResponse, CuratorError> {
        self.call(move |s| async move { s.get_nodes(peer, request).await }).await
    }

    async fn approve_node(&self, peer: Peer, request: ApproveNodeRequest) -> Result<(), CuratorError> {
        self.call(move |s| async move { s.approve_node(peer, request).await }).await
    }

    async fn update_node_roles(&self, peer: Peer, request: UpdateNodeRolesRequest) -> Result<(), CuratorError> {
        self.call(move |s| async move { s.update_node_roles(peer, request).await }).await
    }

    async fn update_node_labels(&self, peer: Peer, request: UpdateNodeLabelsRequest) -> Result<(), CuratorError> {
        self.call(move |s| async move { s.update_node_labels(peer, request).await }).await
    }

    async fn delete_node(&self, peer: Peer, request: DeleteNodeRequest) -> Result<(), CuratorError> {
        self.call(move |s| async move { s.delete_node(peer, request).await }).await
    }

    async fn configure_cluster(
        &self,
        peer: Peer,
        request: ConfigureClusterRequest,
    ) -> Result<ClusterConfiguration, CuratorError> {
        self.call(move |s| async move { s.configure_cluster(peer, request).await }).await
    }

    async fn escrow(&self, peer: Peer, request: EscrowRequest) -> Result<EscrowResponse, CuratorError> {
        self.call(move |s| async move { s.escrow(peer, request).await }).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use futures::future::pending;

    use super::*;

    /// Never answers anything except `get_current_leader`.
    struct Stuck {
        name: &'static str,
    }

    #[async_trait]
    impl CuratorService for Stuck {
        async fn watch(&self, _: Peer, _: WatchRequest) -> Result<NodeWatchStream, CuratorError> {
            Ok(futures::stream::pending().boxed())
        }
        async fn issue_certificate(&self, _: Peer, _: IssueCertificateRequest) -> Result<IssueCertificateResponse, CuratorError> {
            pending().await
        }
        async fn update_node_status(&self, _: Peer, _: UpdateNodeStatusRequest) -> Result<(), CuratorError> {
            pending().await
        }
        async fn update_node_cluster_networking(&self, _: Peer, _: UpdateNodeClusterNetworkingRequest) -> Result<(), CuratorError> {
            pending().await
        }
        async fn get_current_leader(&self, _: Peer) -> Result<GetCurrentLeaderResponse, CuratorError> {
            Ok(GetCurrentLeaderResponse {
                leader_node_id: self.name.to_string(),
                leader_host: String::new(),
                leader_port: 0,
                this_node_id: self.name.to_string(),
            })
        }
        async fn register_node(&self, _: Peer, _: RegisterNodeRequest) -> Result<RegisterNodeResponse, CuratorError> {
            pending().await
        }
        async fn commit_node(&self, _: Peer, _: CommitNodeRequest) -> Result<CommitNodeResponse, CuratorError> {
            pending().await
        }
        async fn join_node(&self, _: Peer, _: JoinNodeRequest) -> Result<JoinNodeResponse, CuratorError> {
            pending().await
        }
        async fn get_register_ticket(&self, _: Peer) -> Result<GetRegisterTicketResponse, CuratorError> {
            pending().await
        }
        async fn get_cluster_info(&self, _: Peer) -> Result<GetClusterInfoResponse, CuratorError> {
            pending().await
        }
        async fn get_nodes(&self, _: Peer, _: GetNodesRequest) -> Result<GetNodesResponse, CuratorError> {
            pending().await
        }
        async fn approve_node(&self, _: Peer, _: ApproveNodeRequest) -> Result<(), CuratorError> {
            pending().await
        }
        async fn update_node_roles(&self, _: Peer, _: UpdateNodeRolesRequest) -> Result<(), CuratorError> {
            pending().await
        }
        async fn update_node_labels(&self, _: Peer, _: UpdateNodeLabelsRequest) -> Result<(), CuratorError> {
            pending().await
        }
        async fn delete_node(&self, _: Peer, _: DeleteNodeRequest) -> Result<(), CuratorError> {
            pending().await
        }
        async fn configure_cluster(&self, _: Peer, _: ConfigureClusterRequest) -> Result<ClusterConfiguration, CuratorError> {
            pending().await
        }
        async fn escrow(&self, _: Peer, _: EscrowRequest) -> Result<EscrowResponse, CuratorError> {
            pending().await
        }
    }

    struct Factory {
        built: AtomicUsize,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl ImplementationFactory for Factory {
        fn build(&self, status: &ElectionStatus, token: &CancellationToken) -> Option<Arc<dyn CuratorService>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(token.clone());
            match status {
                ElectionStatus::Unknown => None,
                ElectionStatus::Leader { .. } => Some(Arc::new(Stuck { name: "leader" })),
                ElectionStatus::Follower { .. } => Some(Arc::new(Stuck { name: "follower" })),
            }
        }
    }

    fn node() -> Peer {
        Peer::Node {
            id: "node-01".into(),
            public_key: [1u8; 32],
        }
    }

    fn follower() -> ElectionStatus {
        ElectionStatus::Follower {
            leader_id: "node-02".into(),
            ttl: Duration::from_secs(60),
        }
    }

    fn factory() -> Arc<Factory> {
        Arc::new(Factory {
            built: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn blocked_call_fails_on_switch() {
        let (status_tx, status_rx) = watch::channel(follower());
        let factory = factory();
        let shutdown = CancellationToken::new();
        let (dispatcher, task) = Dispatcher::spawn(status_rx, factory.clone(), Duration::from_secs(5), shutdown.clone());

        let leader = dispatcher.get_current_leader(node()).await.unwrap();
        assert_eq!(leader.leader_node_id, "follower");

        let blocked = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.get_nodes(node(), GetNodesRequest::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        status_tx
            .send(ElectionStatus::Leader {
                lock_key: "/leader/1".into(),
                lock_rev: 4,
            })
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, CuratorError::BackendSwitched));
        assert_eq!(err.to_string(), "curator backend switched, request can be retried");

        let leader = dispatcher.get_current_leader(node()).await.unwrap();
        assert_eq!(leader.leader_node_id, "leader");
        assert!(factory.tokens.lock().unwrap()[0].is_cancelled());
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn watch_ends_with_switch_error() {
        let (status_tx, status_rx) = watch::channel(follower());
        let shutdown = CancellationToken::new();
        let (dispatcher, _task) = Dispatcher::spawn(status_rx, factory(), Duration::from_secs(5), shutdown.clone());

        let mut stream = dispatcher.watch(node(), WatchRequest { kind: WatchKind::AllNodes }).await.unwrap();
        status_tx.send(ElectionStatus::Unknown).unwrap();
        let item = tokio::time::timeout(Duration::from_secs(5), stream.next()).await.unwrap();
        assert!(matches!(item, Some(Err(CuratorError::BackendSwitched))));
        assert!(stream.next().await.is_none());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_times_out() {
        let (_status_tx, status_rx) = watch::channel(ElectionStatus::Unknown);
        let shutdown = CancellationToken::new();
        let (dispatcher, _task) = Dispatcher::spawn(status_rx, factory(), Duration::from_secs(10), shutdown.clone());

        let err = dispatcher.get_current_leader(node()).await.unwrap_err();
        assert!(matches!(err, CuratorError::Unavailable { .. }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn waiting_call_is_served_once_status_settles() {
        let (status_tx, status_rx) = watch::channel(ElectionStatus::Unknown);
        let shutdown = CancellationToken::new();
        let (dispatcher, _task) = Dispatcher::spawn(status_rx, factory(), Duration::from_secs(5), shutdown.clone());

        let waiting = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.get_current_leader(node()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        status_tx.send(follower()).unwrap();
        let leader = waiting.await.unwrap().unwrap();
        assert_eq!(leader.leader_node_id, "follower");
        shutdown.cancel();
    }
}
