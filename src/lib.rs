//! Curator: the leader-elected control plane of a cluster.
//!
//! One curator per node campaigns for leadership over a shared replicated
//! store ([`curator_kv::KeyValueStore`]). The leader serves node
//! registration, management and certificate issuance, and keeps consensus
//! membership in line with node roles. Followers reject calls and point at
//! the leader. Every write by a leader is fenced by its election key.

pub mod authz;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod curator;
pub mod election;
pub mod error;
pub mod follower;
pub mod identity;
pub mod labels;
pub mod leader;
pub mod leadership;
pub mod listener;
pub mod networking;
pub mod pki;
pub mod rpc;
pub mod server;
pub mod state;

pub use config::CuratorConfig;
pub use curator::Curator;
pub use curator::CuratorHandle;
pub use error::CuratorError;
pub use rpc::CuratorService;
