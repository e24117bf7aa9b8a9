//! Cluster state kept in the store.
//!
//! All accessors are methods on [`Leadership`](crate::leadership::Leadership)
//! and therefore fenced by the election lock.

pub mod cluster;
pub mod global;
pub mod node;

pub use cluster::ClusterConfiguration;
pub use cluster::ClusterConfigurationPatch;
pub use cluster::KubernetesConfig;
pub use cluster::KubernetesConfigPatch;
pub use cluster::StorageSecurity;
pub use cluster::StorageSecurityPolicy;
pub use cluster::TpmMode;
pub use cluster::reconfigure;
pub use node::ClusterNetworking;
pub use node::ConsensusMemberRole;
pub use node::ConsensusPeer;
pub use node::KubernetesControllerRole;
pub use node::KubernetesWorkerRole;
pub use node::Node;
pub use node::NodeRoles;
pub use node::NodeState;
pub use node::NodeStatus;
pub use node::RunningCurator;
pub use node::TpmUsage;
