//! In-process [`ConsensusMembership`] for single-node deployments and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::error::MembershipError;
use crate::traits::ConsensusMembership;
use crate::types::Member;

#[derive(Default)]
struct Members {
    members: Vec<Member>,
    next_id: u64,
}

/// A membership list held in memory.
///
/// Member IDs are assigned sequentially starting at 1. Names must be unique.
#[derive(Default)]
pub struct MemoryMembership {
    inner: Mutex<Members>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a single voting member, as after bootstrapping the log.
    pub fn with_voter(name: impl Into<String>, peer_urls: Vec<String>) -> Self {
        let membership = Self::default();
        {
            let mut inner = membership.inner.lock();
            inner.next_id = 1;
            inner.members.push(Member {
                id: 1,
                name: name.into(),
                peer_urls,
                is_learner: false,
            });
        }
        membership
    }

    /// Add a voting member directly, bypassing the learner stage.
    pub fn add_voter(&self, name: impl Into<String>, peer_urls: Vec<String>) -> Result<Member, MembershipError> {
        let mut inner = self.inner.lock();
        let name = name.into();
        if inner.members.iter().any(|m| m.name == name) {
            return Err(MembershipError::MemberExists { name });
        }
        inner.next_id += 1;
        let member = Member {
            id: inner.next_id,
            name,
            peer_urls,
            is_learner: false,
        };
        inner.members.push(member.clone());
        Ok(member)
    }
}

#[async_trait]
impl ConsensusMembership for MemoryMembership {
    async fn member_list(&self) -> Result<Vec<Member>, MembershipError> {
        Ok(self.inner.lock().members.clone())
    }

    async fn member_add_learner(&self, name: &str, peer_urls: Vec<String>) -> Result<Member, MembershipError> {
        let mut inner = self.inner.lock();
        if inner.members.iter().any(|m| m.name == name) {
            return Err(MembershipError::MemberExists { name: name.to_string() });
        }
        inner.next_id += 1;
        let member = Member {
            id: inner.next_id,
            name: name.to_string(),
            peer_urls,
            is_learner: true,
        };
        info!(member_id = member.id, name, "added learner");
        inner.members.push(member.clone());
        Ok(member)
    }

    async fn member_promote(&self, id: u64) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock();
        let member = inner
            .members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(MembershipError::MemberNotFound { id })?;
        if !member.is_learner {
            return Err(MembershipError::NotLearner { id });
        }
        member.is_learner = false;
        Ok(())
    }

    async fn member_remove(&self, id: u64) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock();
        let index = inner
            .members
            .iter()
            .position(|m| m.id == id)
            .ok_or(MembershipError::MemberNotFound { id })?;
        let voters = inner.members.iter().filter(|m| !m.is_learner).count();
        if !inner.members[index].is_learner && voters == 1 {
            return Err(MembershipError::LastVoter { id });
        }
        let removed = inner.members.remove(index);
        info!(member_id = id, name = %removed.name, "removed member");
        Ok(())
    }
}
