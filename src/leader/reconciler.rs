//! Keeps the consensus member role of nodes in line with actual log membership.
//!
//! Every iteration makes at most one change, so that a partially applied
//! change is always re-evaluated against fresh state on the next tick.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Leader;
use crate::error::CuratorError;

/// What a reconciliation iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Membership and roles agree.
    NoChange,
    /// The local node was missing from membership or nodes; nothing was touched.
    Aborted,
    /// A member without a node record was removed.
    RemovedMember(String),
    /// A member's node was given the consensus member role.
    AddedRole(String),
    /// A node that is not a member lost its consensus roles.
    RemovedRole(String),
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::NoChange => f.write_str("no change"),
            ReconcileOutcome::Aborted => f.write_str("aborted"),
            ReconcileOutcome::RemovedMember(id) => write!(f, "removed member {id}"),
            ReconcileOutcome::AddedRole(id) => write!(f, "added consensus role to {id}"),
            ReconcileOutcome::RemovedRole(id) => write!(f, "removed consensus role from {id}"),
        }
    }
}

impl Leader {
    /// Run one reconciliation iteration.
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome, CuratorError> {
        let _guard = self.node_lock.lock().await;

        // Membership is listed before nodes: a node added in between shows up
        // as a node without membership and is left alone until it joins.
        let members = self.consensus.member_names().await?;
        let nodes = self.leadership.node_list().await?;

        let member_names: HashSet<&str> = members.iter().map(String::as_str).collect();
        let node_ids: Vec<String> = nodes.iter().map(|n| n.id()).collect();
        let local = self.leadership.node_id();

        if !member_names.contains(local) || !node_ids.iter().any(|id| id == local) {
            warn!(node_id = %local, "local node missing from membership or node list, not reconciling");
            return Ok(ReconcileOutcome::Aborted);
        }

        if let Some(member) = members.iter().find(|m| !node_ids.contains(m)) {
            self.consensus.remove_node(member).await?;
            info!(member = %member, "removed consensus member without node");
            return Ok(ReconcileOutcome::RemovedMember(member.clone()));
        }

        for (node, id) in nodes.iter().zip(&node_ids) {
            let is_member = member_names.contains(id.as_str());
            let has_role = node.roles.consensus_member.is_some();
            if is_member && !has_role {
                let address = node.status.as_ref().map(|s| s.external_address.as_str());
                let role = self.consensus.add_node(self.leadership.store().as_ref(), id, node.public_key, address).await?;
                let mut node = node.clone();
                node.roles.consensus_member = Some(role);
                self.leadership.node_save(&node).await?;
                info!(node_id = %id, "added consensus member role");
                return Ok(ReconcileOutcome::AddedRole(id.clone()));
            }
            if !is_member && has_role {
                let mut node = node.clone();
                node.roles.kubernetes_controller = None;
                node.roles.consensus_member = None;
                self.leadership.node_save(&node).await?;
                info!(node_id = %id, "removed consensus member role");
                return Ok(ReconcileOutcome::RemovedRole(id.clone()));
            }
        }
        Ok(ReconcileOutcome::NoChange)
    }

    /// Reconcile every `interval` until `cancel` fires.
    pub async fn run_reconciler(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.reconcile_once().await {
                Ok(ReconcileOutcome::NoChange) => debug!("membership in sync"),
                Ok(outcome) => debug!(%outcome, "reconciled"),
                Err(e) if e.is_leadership_loss() => {
                    debug!(error = %e, "reconciler stopping after leadership loss");
                    break;
                }
                Err(e) => warn!(error = %e, "reconciliation failed"),
            }
        }
        debug!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;

    use curator_kv::ConsensusMembership;
    use proptest::prelude::*;

    use super::super::testing::*;
    use super::*;
    use crate::state::ClusterConfiguration;
    use crate::state::KubernetesControllerRole;
    use crate::state::NodeState;

    #[tokio::test]
    async fn converges_one_change_at_a_time() {
        let f = fixture(ClusterConfiguration::default()).await;
        assert_eq!(f.leader.reconcile_once().await.unwrap(), ReconcileOutcome::NoChange);

        // A member whose node was deleted.
        f.membership.add_voter("node-gone", vec!["https://gone:7834".into()]).unwrap();
        // A member whose node lacks the role.
        let joining = add_node(&f, 0x20, NodeState::Up).await;
        f.membership.add_voter(joining.id(), vec!["https://joining:7834".into()]).unwrap();
        // A node with roles but no membership.
        let mut stale = add_node(&f, 0x30, NodeState::Up).await;
        stale.roles.consensus_member = load(&f, &f.local).await.roles.consensus_member;
        stale.roles.kubernetes_controller = Some(KubernetesControllerRole {});
        f.leader.leadership.node_save(&stale).await.unwrap();

        assert_eq!(
            f.leader.reconcile_once().await.unwrap(),
            ReconcileOutcome::RemovedMember("node-gone".into())
        );
        assert_eq!(
            f.leader.reconcile_once().await.unwrap(),
            ReconcileOutcome::AddedRole(joining.id())
        );
        assert_eq!(
            f.leader.reconcile_once().await.unwrap(),
            ReconcileOutcome::RemovedRole(stale.id())
        );
        assert_eq!(f.leader.reconcile_once().await.unwrap(), ReconcileOutcome::NoChange);

        assert!(load(&f, &joining).await.roles.consensus_member.is_some());
        let stale = load(&f, &stale).await;
        assert!(stale.roles.consensus_member.is_none());
        assert!(stale.roles.kubernetes_controller.is_none());
        assert!(load(&f, &f.local).await.roles.consensus_member.is_some());
    }

    #[tokio::test]
    async fn aborts_when_local_node_is_not_a_member() {
        let f = fixture(ClusterConfiguration::default()).await;
        f.membership.add_voter("node-other", Vec::new()).unwrap();
        let local = f
            .membership
            .member_list()
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.name == f.local.id())
            .unwrap();
        f.membership.member_remove(local.id).await.unwrap();

        assert_eq!(f.leader.reconcile_once().await.unwrap(), ReconcileOutcome::Aborted);
        assert!(f.membership.member_list().await.unwrap().iter().any(|m| m.name == "node-other"));
        assert!(load(&f, &f.local).await.roles.consensus_member.is_some());
    }

    #[tokio::test]
    async fn aborts_when_local_node_record_is_missing() {
        let f = fixture(ClusterConfiguration::default()).await;
        f.leader.leadership.node_destroy(&f.local).await.unwrap();
        assert_eq!(f.leader.reconcile_once().await.unwrap(), ReconcileOutcome::Aborted);
        assert_eq!(f.membership.member_list().await.unwrap().len(), 1);
    }

    #[derive(Debug, Clone, Copy)]
    enum MemberKind {
        Voter,
        Learner,
        Absent,
    }

    fn arb_member_kind() -> impl Strategy<Value = MemberKind> {
        prop_oneof![Just(MemberKind::Voter), Just(MemberKind::Learner), Just(MemberKind::Absent)]
    }

    /// Named members, and whether each node holds the consensus role.
    async fn snapshot(f: &Fixture) -> (BTreeSet<String>, BTreeMap<String, bool>) {
        let members = f.leader.consensus.member_names().await.unwrap().into_iter().collect();
        let roles = f
            .leader
            .leadership
            .node_list()
            .await
            .unwrap()
            .iter()
            .map(|n| (n.id(), n.roles.consensus_member.is_some()))
            .collect();
        (members, roles)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn mixed_clusters_converge_one_change_per_step(
            specs in prop::collection::vec((arb_member_kind(), any::<bool>(), any::<bool>()), 0..6),
            strays in 0usize..3,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let f = fixture(ClusterConfiguration::default()).await;
                let local_id = f.local.id();
                let local_role = load(&f, &f.local).await.roles.consensus_member;

                for (i, (kind, has_role, controller)) in specs.iter().enumerate() {
                    let mut node = add_node(&f, 0x20 + i as u8, NodeState::Up).await;
                    if *has_role {
                        node.roles.consensus_member = local_role.clone();
                        if *controller {
                            node.roles.kubernetes_controller = Some(KubernetesControllerRole {});
                        }
                        f.leader.leadership.node_save(&node).await.unwrap();
                    }
                    let urls = vec![format!("https://{}:7834", node.id())];
                    match kind {
                        MemberKind::Voter => {
                            f.membership.add_voter(node.id(), urls).unwrap();
                        }
                        MemberKind::Learner => {
                            f.membership.member_add_learner(&node.id(), urls).await.unwrap();
                        }
                        MemberKind::Absent => {}
                    }
                }
                for i in 0..strays {
                    f.membership.add_voter(format!("node-stray-{i}"), Vec::new()).unwrap();
                }

                let mut state = snapshot(&f).await;
                let mut converged = false;
                for _ in 0..specs.len() + strays + 2 {
                    let outcome = f.leader.reconcile_once().await.unwrap();
                    let next = snapshot(&f).await;
                    let changes = state.0.symmetric_difference(&next.0).count()
                        + next.1.iter().filter(|(id, role)| state.1.get(*id) != Some(*role)).count();

                    prop_assert!(next.0.contains(&local_id));
                    prop_assert_eq!(next.1.get(&local_id), Some(&true));
                    match outcome {
                        ReconcileOutcome::NoChange => {
                            prop_assert_eq!(changes, 0);
                            converged = true;
                            break;
                        }
                        ReconcileOutcome::Aborted => {
                            prop_assert!(false, "aborted with the local node present");
                        }
                        _ => {
                            prop_assert_eq!(changes, 1);
                        }
                    }
                    state = next;
                }
                prop_assert!(converged);

                let (members, roles) = state;
                for (id, has_role) in &roles {
                    prop_assert_eq!(*has_role, members.contains(id));
                }
                prop_assert!(members.iter().all(|m| roles.contains_key(m)));
                Ok(())
            })?;
        }
    }
}
