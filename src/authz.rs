//! Who may call what.
//!
//! Every RPC method has an entry in an [`AuthorizationPolicy`]. A method
//! without an entry is never callable.

use std::collections::HashMap;
use std::fmt;

use crate::error::CuratorError;
use crate::error::InternalSnafu;
use crate::error::PermissionDeniedSnafu;
use crate::error::UnauthenticatedSnafu;
use crate::identity::OWNER_IDENTITY;

/// The authenticated identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    /// A cluster node, authenticated by its node certificate.
    Node { id: String, public_key: [u8; 32] },
    /// A user, authenticated by a client certificate from the cluster CA.
    User { identity: String },
    /// No cluster credentials. `transport_key` is the key of a self-signed
    /// certificate the caller presented, if any.
    Unauthenticated { transport_key: Option<[u8; 32]> },
}

impl Peer {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Peer::Node { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn transport_key(&self) -> Option<[u8; 32]> {
        match self {
            Peer::Unauthenticated { transport_key } => *transport_key,
            _ => None,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Node { id, .. } => write!(f, "node {id}"),
            Peer::User { identity } => write!(f, "user {identity}"),
            Peer::Unauthenticated { .. } => f.write_str("unauthenticated peer"),
        }
    }
}

/// RPC methods of the curator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Watch,
    IssueCertificate,
    UpdateNodeStatus,
    UpdateNodeClusterNetworking,
    GetCurrentLeader,
    RegisterNode,
    CommitNode,
    JoinNode,
    GetRegisterTicket,
    GetClusterInfo,
    GetNodes,
    ApproveNode,
    UpdateNodeRoles,
    UpdateNodeLabels,
    DeleteNode,
    ConfigureCluster,
    Escrow,
}

impl Method {
    pub const ALL: [Method; 17] = [
        Method::Watch,
        Method::IssueCertificate,
        Method::UpdateNodeStatus,
        Method::UpdateNodeClusterNetworking,
        Method::GetCurrentLeader,
        Method::RegisterNode,
        Method::CommitNode,
        Method::JoinNode,
        Method::GetRegisterTicket,
        Method::GetClusterInfo,
        Method::GetNodes,
        Method::ApproveNode,
        Method::UpdateNodeRoles,
        Method::UpdateNodeLabels,
        Method::DeleteNode,
        Method::ConfigureCluster,
        Method::Escrow,
    ];
}

/// Management permissions. The owner holds all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    GetRegisterTicket,
    ReadClusterStatus,
    ApproveNode,
    UpdateNodeRoles,
    UpdateNodeLabels,
    DeleteNode,
    ConfigureCluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Callable without cluster credentials.
    Unauthenticated,
    /// Callable by any cluster node.
    Node,
    /// Callable by a user holding the permission.
    Owner(Permission),
}

#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    entries: HashMap<Method, Authorization>,
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        use Authorization::*;

        let entries = HashMap::from([
            (Method::Watch, Node),
            (Method::IssueCertificate, Node),
            (Method::UpdateNodeStatus, Node),
            (Method::UpdateNodeClusterNetworking, Node),
            (Method::GetCurrentLeader, Node),
            (Method::RegisterNode, Unauthenticated),
            (Method::CommitNode, Unauthenticated),
            (Method::JoinNode, Unauthenticated),
            (Method::Escrow, Unauthenticated),
            (Method::GetRegisterTicket, Owner(Permission::GetRegisterTicket)),
            (Method::GetClusterInfo, Owner(Permission::ReadClusterStatus)),
            (Method::GetNodes, Owner(Permission::ReadClusterStatus)),
            (Method::ApproveNode, Owner(Permission::ApproveNode)),
            (Method::UpdateNodeRoles, Owner(Permission::UpdateNodeRoles)),
            (Method::UpdateNodeLabels, Owner(Permission::UpdateNodeLabels)),
            (Method::DeleteNode, Owner(Permission::DeleteNode)),
            (Method::ConfigureCluster, Owner(Permission::ConfigureCluster)),
        ]);
        Self { entries }
    }
}

impl AuthorizationPolicy {
    /// A policy with no entries; every call is rejected.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with(mut self, method: Method, authorization: Authorization) -> Self {
        self.entries.insert(method, authorization);
        self
    }

    pub fn check_permissions(&self, peer: &Peer, method: Method) -> Result<(), CuratorError> {
        let Some(authorization) = self.entries.get(&method) else {
            return InternalSnafu {
                message: format!("no authorization policy for {method:?}"),
            }
            .fail();
        };

        match (authorization, peer) {
            (Authorization::Unauthenticated, _) => Ok(()),
            (_, Peer::Unauthenticated { .. }) => UnauthenticatedSnafu {
                message: format!("{method:?} requires cluster credentials"),
            }
            .fail(),
            (Authorization::Node, Peer::Node { .. }) => Ok(()),
            (Authorization::Node, Peer::User { .. }) => PermissionDeniedSnafu {
                message: format!("{method:?} can only be called by cluster nodes"),
            }
            .fail(),
            (Authorization::Owner(_), Peer::User { identity }) if identity == OWNER_IDENTITY => Ok(()),
            (Authorization::Owner(permission), _) => PermissionDeniedSnafu {
                message: format!("{peer} does not hold permission {permission:?}"),
            }
            .fail(),
        }
    }
}
