//! Request and response types for conditional transactions, watches and membership.

use std::fmt;

use futures::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;

use crate::error::KeyValueStoreError;

/// Identifier of a lease granted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A stored key together with its MVCC metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created. Zero means the key does not exist.
    pub create_revision: u64,
    /// Revision of the last modification.
    pub mod_revision: u64,
    /// Number of modifications since creation, starting at 1.
    pub version: u64,
    pub lease: Option<LeaseId>,
}

/// What a [`Compare`] inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Value(Vec<u8>),
    Version(u64),
    CreateRevision(u64),
    ModRevision(u64),
}

/// Comparison operator for transaction conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    fn holds<T: Ord + ?Sized>(self, current: &T, expected: &T) -> bool {
        match self {
            CompareOp::Equal => current == expected,
            CompareOp::NotEqual => current != expected,
            CompareOp::Greater => current > expected,
            CompareOp::Less => current < expected,
        }
    }
}

/// A condition evaluated against the current state of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
    pub op: CompareOp,
}

impl Compare {
    /// Holds if `key` does not exist yet.
    pub fn absent(key: impl Into<String>) -> Self {
        Self::create_revision(key, CompareOp::Equal, 0)
    }

    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: u64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision(revision),
            op,
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: u64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::ModRevision(revision),
            op,
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Value(value.into()),
            op,
        }
    }

    /// Evaluate against the current entry for the key, if any.
    ///
    /// Value comparisons never hold for a missing key; revision and version
    /// comparisons treat a missing key as zero.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::Value(expected) => match current {
                Some(kv) => self.op.holds(kv.value.as_slice(), expected.as_slice()),
                None => false,
            },
            CompareTarget::Version(expected) => self.op.holds(&current.map_or(0, |kv| kv.version), expected),
            CompareTarget::CreateRevision(expected) => {
                self.op.holds(&current.map_or(0, |kv| kv.create_revision), expected)
            }
            CompareTarget::ModRevision(expected) => self.op.holds(&current.map_or(0, |kv| kv.mod_revision), expected),
        }
    }
}

/// Operations that can be performed in a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    Get { key: String },
    /// All keys in `[start, end)`, at most `limit` if set.
    Range { start: String, end: String, limit: Option<usize> },
    Put { key: String, value: Vec<u8>, lease: Option<LeaseId> },
    Delete { key: String },
    DeleteRange { start: String, end: String },
}

impl TxnOp {
    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn range((start, end): (String, String)) -> Self {
        TxnOp::Range { start, end, limit: None }
    }

    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, TxnOp::Put { .. } | TxnOp::Delete { .. } | TxnOp::DeleteRange { .. })
    }
}

/// Result of a single transaction operation, in branch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOpResult {
    Get { kv: Option<KeyValue> },
    Range { kvs: Vec<KeyValue>, more: bool },
    Put { revision: u64 },
    Delete { deleted: u32 },
}

impl TxnOpResult {
    /// The single entry returned by a `Get`, or the first entry of a `Range`.
    pub fn into_kv(self) -> Option<KeyValue> {
        match self {
            TxnOpResult::Get { kv } => kv,
            TxnOpResult::Range { kvs, .. } => kvs.into_iter().next(),
            _ => None,
        }
    }

    /// All entries returned by a `Get` or `Range`.
    pub fn into_kvs(self) -> Vec<KeyValue> {
        match self {
            TxnOpResult::Get { kv } => kv.into_iter().collect(),
            TxnOpResult::Range { kvs, .. } => kvs,
            _ => Vec::new(),
        }
    }
}

/// An atomic batch: if every `compare` holds, `success` runs, otherwise `failure`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: impl IntoIterator<Item = Compare>) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnResponse {
    /// Whether all compares held and the success branch ran.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: u64,
    pub results: Vec<TxnOpResult>,
}

impl TxnResponse {
    /// Entries read by the `Get` or `Range` at `index` of the executed branch.
    pub fn kvs(&self, index: usize) -> &[KeyValue] {
        match self.results.get(index) {
            Some(TxnOpResult::Get { kv }) => kv.as_slice(),
            Some(TxnOpResult::Range { kvs, .. }) => kvs,
            _ => &[],
        }
    }

    /// First entry read by the operation at `index`.
    pub fn kv(&self, index: usize) -> Option<&KeyValue> {
        self.kvs(index).first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change to a key. Delete events carry the key and the deleting revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// All events committed by one revision that match a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResponse {
    pub revision: u64,
    pub events: Vec<WatchEvent>,
}

/// Which keys to watch and from which revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub start: String,
    /// Exclusive end of the range. `None` watches `start` alone.
    pub end: Option<String>,
    /// First revision to deliver. Zero means only changes after the watch is created.
    pub start_revision: u64,
}

impl WatchRequest {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            start: key.into(),
            end: None,
            start_revision: 0,
        }
    }

    pub fn range((start, end): (String, String)) -> Self {
        Self {
            start,
            end: Some(end),
            start_revision: 0,
        }
    }

    pub fn from_revision(mut self, revision: u64) -> Self {
        self.start_revision = revision;
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.end {
            None => key == self.start,
            Some(end) => key >= self.start.as_str() && key < end.as_str(),
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchResponse, KeyValueStoreError>>;

/// A member of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    /// Name the member announced; the curator uses node IDs.
    pub name: String,
    pub peer_urls: Vec<String>,
    pub is_learner: bool,
}
