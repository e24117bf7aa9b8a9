//! Consensus membership administration.
//!
//! Produces the [`ConsensusMemberRole`] a node needs to run a member of the
//! replicated log, and adds or removes the corresponding log members.

use std::net::IpAddr;
use std::sync::Arc;

use curator_kv::ConsensusMembership;
use curator_kv::KeyValueStore;
use snafu::ResultExt;
use tracing::info;
use tracing::trace;

use crate::error::CuratorError;
use crate::error::MembershipSnafu;
use crate::error::PkiSnafu;
use crate::pki::PkiContext;
use crate::state::ConsensusMemberRole;
use crate::state::ConsensusPeer;

pub struct ConsensusAdmin {
    membership: Arc<dyn ConsensusMembership>,
    pki: Arc<PkiContext>,
    peer_port: u16,
}

impl ConsensusAdmin {
    pub fn new(membership: Arc<dyn ConsensusMembership>, pki: Arc<PkiContext>, peer_port: u16) -> Self {
        Self {
            membership,
            pki,
            peer_port,
        }
    }

    pub fn membership(&self) -> &Arc<dyn ConsensusMembership> {
        &self.membership
    }

    /// Names of all current members, learners included.
    ///
    /// A learner that has not started yet has no name. It is left out until
    /// it publishes one, so the reconciler neither removes it nor matches it
    /// to a node.
    pub async fn member_names(&self) -> Result<Vec<String>, CuratorError> {
        let members = self.membership.member_list().await.context(MembershipSnafu)?;
        let mut names = Vec::with_capacity(members.len());
        for member in members {
            if member.name.is_empty() {
                trace!(member_id = member.id, "skipping unnamed consensus member");
                continue;
            }
            names.push(member.name);
        }
        Ok(names)
    }

    /// Issue peer credentials for a node and make it a member, as a learner if it is new.
    ///
    /// Adding a node that already is a member only refreshes its credentials.
    pub async fn add_node(
        &self,
        store: &dyn KeyValueStore,
        id: &str,
        public_key: [u8; 32],
        external_address: Option<&str>,
    ) -> Result<ConsensusMemberRole, CuratorError> {
        let address: Option<IpAddr> = external_address.and_then(|a| a.parse().ok());
        let ca_certificate = self.pki.consensus_ca().ensure(store).await.context(PkiSnafu)?;
        let peer_certificate = self
            .pki
            .consensus_peer_certificate(id, public_key, address)
            .ensure(store)
            .await
            .context(PkiSnafu)?;

        let members = self.membership.member_list().await.context(MembershipSnafu)?;
        let peers = members
            .iter()
            .filter(|m| !m.is_learner && !m.name.is_empty())
            .filter_map(|m| {
                m.peer_urls.first().map(|url| ConsensusPeer {
                    name: m.name.clone(),
                    url: url.clone(),
                })
            })
            .collect();

        let crl = self.pki.consensus_ca().crl(store).await.context(PkiSnafu)?.map(|crl| crl.der).unwrap_or_default();

        if !members.iter().any(|m| m.name == id) {
            let host = external_address.unwrap_or(id);
            let url = format!("https://{host}:{}", self.peer_port);
            let member = self
                .membership
                .member_add_learner(id, vec![url.clone()])
                .await
                .context(MembershipSnafu)?;
            info!(node_id = %id, member_id = member.id, url = %url, "added consensus learner");
        }

        Ok(ConsensusMemberRole {
            ca_certificate,
            peer_certificate,
            crl,
            peers,
        })
    }

    /// Remove the member named `id`. Returns whether a member was removed.
    pub async fn remove_node(&self, id: &str) -> Result<bool, CuratorError> {
        let members = self.membership.member_list().await.context(MembershipSnafu)?;
        let Some(member) = members.into_iter().find(|m| m.name == id) else {
            return Ok(false);
        };
        self.membership.member_remove(member.id).await.context(MembershipSnafu)?;
        info!(node_id = %id, member_id = member.id, "removed consensus member");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use curator_kv::MemoryMembership;
    use curator_kv::MemoryStore;
    use curator_pki::verify;

    use super::*;

    fn admin(membership: Arc<MemoryMembership>) -> ConsensusAdmin {
        ConsensusAdmin::new(membership, Arc::new(PkiContext::new()), 7834)
    }

    #[tokio::test]
    async fn adds_learner_once() {
        let store = MemoryStore::new();
        let membership = Arc::new(MemoryMembership::with_voter("node-a", vec!["https://node-a:7834".into()]));
        let admin = admin(membership.clone());

        let role = admin.add_node(&*store, "node-b", [2u8; 32], Some("10.0.0.2")).await.unwrap();
        assert_eq!(role.peers.len(), 1);
        assert_eq!(role.peers[0].name, "node-a");
        verify::verify_signed_by(&role.peer_certificate, &role.ca_certificate).unwrap();
        assert!(!role.crl.is_empty());

        admin.add_node(&*store, "node-b", [2u8; 32], Some("10.0.0.2")).await.unwrap();
        let members = membership.member_list().await.unwrap();
        assert_eq!(members.len(), 2);
        let learner = members.iter().find(|m| m.name == "node-b").unwrap();
        assert!(learner.is_learner);
        assert_eq!(learner.peer_urls, vec!["https://10.0.0.2:7834".to_string()]);
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let membership = Arc::new(MemoryMembership::with_voter("node-a", Vec::new()));
        let admin = admin(membership);
        assert!(!admin.remove_node("node-z").await.unwrap());
    }

    #[tokio::test]
    async fn unnamed_learners_are_not_listed() {
        let membership = Arc::new(MemoryMembership::with_voter("node-a", Vec::new()));
        membership.member_add_learner("", vec!["https://10.0.0.9:7834".into()]).await.unwrap();
        let admin = admin(membership.clone());
        assert_eq!(admin.member_names().await.unwrap(), vec!["node-a".to_string()]);
        assert_eq!(membership.member_list().await.unwrap().len(), 2);
    }
}
