//! Single-process implementation of [`KeyValueStore`].
//!
//! `MemoryStore` keeps an MVCC view of the keyspace: every committed
//! transaction with writes bumps the store revision once, and every key
//! carries its create/mod revisions and version. Leases expire on the tokio
//! clock, so tests can drive them with `tokio::time::pause`. A bounded
//! history of committed changes backs watches that start in the past.
//!
//! With [`MemoryStore::open`] every commit is written through to redb first.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::KeyValueStoreError;
use crate::persistent::RedbBackend;
use crate::persistent::StoredEntry;
use crate::traits::KeyValueStore;
use crate::types::EventKind;
use crate::types::KeyValue;
use crate::types::LeaseId;
use crate::types::TxnOp;
use crate::types::TxnOpResult;
use crate::types::TxnRequest;
use crate::types::TxnResponse;
use crate::types::WatchEvent;
use crate::types::WatchRequest;
use crate::types::WatchResponse;
use crate::types::WatchStream;

/// Number of committed revisions retained for watches starting in the past.
pub const WATCH_HISTORY_LIMIT: usize = 10_000;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    data: BTreeMap<String, StoredEntry>,
    revision: u64,
    leases: HashMap<LeaseId, Lease>,
    next_lease: u64,
    history: VecDeque<Arc<WatchResponse>>,
    /// Highest revision no longer present in `history`.
    compacted: u64,
}

/// Writes staged by one transaction, layered over the committed data.
struct Staged<'a> {
    base: &'a BTreeMap<String, StoredEntry>,
    changes: BTreeMap<String, Option<StoredEntry>>,
}

impl<'a> Staged<'a> {
    fn new(base: &'a BTreeMap<String, StoredEntry>) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&StoredEntry> {
        match self.changes.get(key) {
            Some(change) => change.as_ref(),
            None => self.base.get(key),
        }
    }

    fn keys_in(&self, start: &str, end: &str) -> Vec<String> {
        if start >= end {
            return Vec::new();
        }
        let bounds = (Bound::Included(start), Bound::Excluded(end));
        let mut keys: BTreeSet<String> = self
            .base
            .range::<str, _>(bounds)
            .map(|(k, _)| k.clone())
            .collect();
        for (key, change) in self.changes.range::<str, _>(bounds) {
            match change {
                Some(_) => keys.insert(key.clone()),
                None => keys.remove(key),
            };
        }
        keys.into_iter().collect()
    }
}

/// A deterministic in-memory store with optional redb durability.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<Arc<WatchResponse>>,
    backend: Option<RedbBackend>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_backend(None, State::default())
    }
}

impl MemoryStore {
    /// Create a new, empty, non-durable store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open (or create) a durable store backed by the redb file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, KeyValueStoreError> {
        let backend = RedbBackend::open(path)?;
        let snapshot = backend.load()?;
        debug!(
            path = %backend.path().display(),
            keys = snapshot.entries.len(),
            revision = snapshot.revision,
            "opened persistent store"
        );
        let state = State {
            data: snapshot.entries,
            revision: snapshot.revision,
            compacted: snapshot.revision,
            ..State::default()
        };
        Ok(Arc::new(Self::with_backend(Some(backend), state)))
    }

    fn with_backend(backend: Option<RedbBackend>, state: State) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(state),
            events,
            backend,
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Periodically expire leases even when no client touches the store.
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    pub fn spawn_lease_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let mut state = store.state.lock();
                if let Err(err) = store.expire_leases(&mut state) {
                    tracing::warn!(error = %err, "lease reaper failed to expire leases");
                }
            }
        })
    }

    fn expire_leases(&self, state: &mut State) -> Result<(), KeyValueStoreError> {
        let now = Instant::now();
        let expired: Vec<LeaseId> =
            state.leases.iter().filter(|(_, lease)| lease.deadline <= now).map(|(id, _)| *id).collect();
        for id in expired {
            debug!(lease = %id, "lease expired");
            self.drop_lease(state, id)?;
        }
        Ok(())
    }

    fn drop_lease(&self, state: &mut State, id: LeaseId) -> Result<(), KeyValueStoreError> {
        let Some(lease) = state.leases.get(&id) else {
            return Err(KeyValueStoreError::LeaseNotFound { lease: id });
        };
        let mut changes = BTreeMap::new();
        for key in &lease.keys {
            if state.data.contains_key(key) {
                changes.insert(key.clone(), None);
            }
        }
        if !changes.is_empty() {
            self.commit(state, changes)?;
        }
        state.leases.remove(&id);
        Ok(())
    }

    /// Persist and apply staged changes as one new revision, then notify watchers.
    fn commit(&self, state: &mut State, changes: BTreeMap<String, Option<StoredEntry>>) -> Result<u64, KeyValueStoreError> {
        let revision = state.revision + 1;
        if let Some(backend) = &self.backend {
            backend.commit(&changes, revision)?;
        }

        let mut events = Vec::with_capacity(changes.len());
        for (key, change) in changes {
            let previous = match &change {
                Some(entry) => state.data.insert(key.clone(), entry.clone()),
                None => state.data.remove(&key),
            };
            if let Some(lease) = previous.as_ref().and_then(|e| e.lease) {
                if let Some(lease) = state.leases.get_mut(&lease) {
                    lease.keys.remove(&key);
                }
            }
            let event = match change {
                Some(entry) => {
                    if let Some(lease) = entry.lease.and_then(|id| state.leases.get_mut(&id)) {
                        lease.keys.insert(key.clone());
                    }
                    WatchEvent {
                        kind: EventKind::Put,
                        kv: to_key_value(&key, &entry),
                    }
                }
                None => WatchEvent {
                    kind: EventKind::Delete,
                    kv: KeyValue {
                        key,
                        value: Vec::new(),
                        create_revision: 0,
                        mod_revision: revision,
                        version: 0,
                        lease: None,
                    },
                },
            };
            events.push(event);
        }

        state.revision = revision;
        let response = Arc::new(WatchResponse { revision, events });
        state.history.push_back(response.clone());
        while state.history.len() > WATCH_HISTORY_LIMIT {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.revision;
            }
        }
        // No receivers is not an error: nobody is watching.
        let _ = self.events.send(response);
        Ok(revision)
    }

    fn execute(&self, state: &mut State, request: TxnRequest) -> Result<TxnResponse, KeyValueStoreError> {
        let succeeded = request.compare.iter().all(|cmp| {
            let current = state.data.get(&cmp.key).map(|entry| to_key_value(&cmp.key, entry));
            cmp.evaluate(current.as_ref())
        });
        let ops = if succeeded { request.success } else { request.failure };

        let next_revision = state.revision + 1;
        let mut staged = Staged::new(&state.data);
        let mut results = Vec::with_capacity(ops.len());
        let mut wrote = false;

        for op in ops {
            let result = match op {
                TxnOp::Get { key } => TxnOpResult::Get {
                    kv: staged.get(&key).map(|entry| to_key_value(&key, entry)),
                },
                TxnOp::Range { start, end, limit } => {
                    let keys = staged.keys_in(&start, &end);
                    let more = limit.is_some_and(|limit| keys.len() > limit);
                    let kvs = keys
                        .iter()
                        .take(limit.unwrap_or(usize::MAX))
                        .filter_map(|key| staged.get(key).map(|entry| to_key_value(key, entry)))
                        .collect();
                    TxnOpResult::Range { kvs, more }
                }
                TxnOp::Put { key, value, lease } => {
                    if key.is_empty() {
                        return Err(KeyValueStoreError::EmptyKey);
                    }
                    if let Some(lease) = lease {
                        if !state.leases.contains_key(&lease) {
                            return Err(KeyValueStoreError::LeaseNotFound { lease });
                        }
                    }
                    let entry = match staged.get(&key) {
                        Some(existing) => StoredEntry {
                            value,
                            create_revision: existing.create_revision,
                            mod_revision: next_revision,
                            version: existing.version + 1,
                            lease,
                        },
                        None => StoredEntry {
                            value,
                            create_revision: next_revision,
                            mod_revision: next_revision,
                            version: 1,
                            lease,
                        },
                    };
                    staged.changes.insert(key, Some(entry));
                    wrote = true;
                    TxnOpResult::Put { revision: next_revision }
                }
                TxnOp::Delete { key } => {
                    let deleted = if staged.get(&key).is_some() {
                        staged.changes.insert(key, None);
                        wrote = true;
                        1
                    } else {
                        0
                    };
                    TxnOpResult::Delete { deleted }
                }
                TxnOp::DeleteRange { start, end } => {
                    let keys = staged.keys_in(&start, &end);
                    let deleted = keys.len() as u32;
                    for key in keys {
                        staged.changes.insert(key, None);
                        wrote = true;
                    }
                    TxnOpResult::Delete { deleted }
                }
            };
            results.push(result);
        }

        let changes = staged.changes;
        let revision = if wrote && !changes.is_empty() {
            self.commit(state, changes)?
        } else {
            state.revision
        };

        Ok(TxnResponse {
            succeeded,
            revision,
            results,
        })
    }
}

fn to_key_value(key: &str, entry: &StoredEntry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        version: entry.version,
        lease: entry.lease,
    }
}

/// Restrict a committed revision to the events a watch cares about.
fn filter_response(request: &WatchRequest, response: &WatchResponse) -> Option<WatchResponse> {
    let events: Vec<WatchEvent> = response.events.iter().filter(|e| request.matches(&e.kv.key)).cloned().collect();
    if events.is_empty() {
        return None;
    }
    Some(WatchResponse {
        revision: response.revision,
        events,
    })
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, KeyValueStoreError> {
        let mut state = self.state.lock();
        self.expire_leases(&mut state)?;
        self.execute(&mut state, request)
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        let (backlog, receiver, last_revision) = {
            let mut state = self.state.lock();
            self.expire_leases(&mut state)?;
            if request.start_revision != 0 && request.start_revision <= state.compacted {
                return Err(KeyValueStoreError::Compacted {
                    requested: request.start_revision,
                    compacted: state.compacted,
                });
            }
            let backlog: Vec<WatchResponse> = if request.start_revision == 0 {
                Vec::new()
            } else {
                state
                    .history
                    .iter()
                    .filter(|response| response.revision >= request.start_revision)
                    .filter_map(|response| filter_response(&request, response))
                    .collect()
            };
            // Subscribing under the lock guarantees no commit falls between backlog and live events.
            (backlog, self.events.subscribe(), state.revision)
        };

        let live = futures::stream::unfold(Some((receiver, request)), move |cursor| async move {
            let (mut receiver, request) = cursor?;
            loop {
                match receiver.recv().await {
                    Ok(response) => {
                        if response.revision <= last_revision {
                            continue;
                        }
                        if let Some(filtered) = filter_response(&request, &response) {
                            return Some((Ok(filtered), Some((receiver, request))));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some((Err(KeyValueStoreError::WatchLagged { skipped }), None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(futures::stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KeyValueStoreError> {
        let mut state = self.state.lock();
        self.expire_leases(&mut state)?;
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);
        state.leases.insert(id, Lease {
            ttl,
            deadline: Instant::now() + ttl,
            keys: BTreeSet::new(),
        });
        debug!(lease = %id, ttl_ms = ttl.as_millis() as u64, "granted lease");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, KeyValueStoreError> {
        let mut state = self.state.lock();
        self.expire_leases(&mut state)?;
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.ttl;
                Ok(entry.ttl)
            }
            None => Err(KeyValueStoreError::LeaseNotFound { lease }),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KeyValueStoreError> {
        let mut state = self.state.lock();
        self.expire_leases(&mut state)?;
        self.drop_lease(&mut state, lease)
    }
}
