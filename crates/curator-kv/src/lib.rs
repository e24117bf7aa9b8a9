//! Replicated-log abstractions used by the curator.
//!
//! The curator treats its consensus log as a key-value store offering
//! conditional transactions, ranged watches and TTL leases
//! ([`KeyValueStore`]), plus membership control ([`ConsensusMembership`]).
//! [`MemoryStore`] and [`MemoryMembership`] implement both in-process, with
//! optional redb persistence for single-node deployments.

mod error;
pub mod keyspace;
mod memory;
mod membership;
mod persistent;
mod traits;
mod types;

pub use error::KeyValueStoreError;
pub use error::MembershipError;
pub use keyspace::KeyspaceError;
pub use keyspace::KeyspacePrefix;
pub use keyspace::prefix_end;
pub use memory::MemoryStore;
pub use memory::WATCH_HISTORY_LIMIT;
pub use membership::MemoryMembership;
pub use persistent::StorageError;
pub use traits::ConsensusMembership;
pub use traits::KeyValueStore;
pub use types::Compare;
pub use types::CompareOp;
pub use types::CompareTarget;
pub use types::EventKind;
pub use types::KeyValue;
pub use types::LeaseId;
pub use types::Member;
pub use types::TxnOp;
pub use types::TxnOpResult;
pub use types::TxnRequest;
pub use types::TxnResponse;
pub use types::WatchEvent;
pub use types::WatchRequest;
pub use types::WatchResponse;
pub use types::WatchStream;
