//! redb-backed durability for [`MemoryStore`](crate::MemoryStore).
//!
//! Every committed revision is written through to a single redb file before
//! it becomes visible in memory. On open the full keyspace is loaded back.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::types::LeaseId;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const REVISION_KEY: &str = "revision";

/// A stored value with its MVCC metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub value: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub version: u64,
    pub lease: Option<LeaseId>,
}

/// Errors from the redb persistence layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("failed to create directory {}: {source}", path.display()))]
    CreateDirectory { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to open redb database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
    },

    #[snafu(display("failed to begin transaction: {source}"))]
    BeginTransaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    #[snafu(display("failed to open table: {source}"))]
    OpenTable {
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
    },

    #[snafu(display("failed to commit transaction: {source}"))]
    Commit {
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
    },

    #[snafu(display("table access failed: {source}"))]
    Access {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    #[snafu(display("failed to encode or decode entry '{key}': {source}"))]
    Codec { key: String, source: bincode::Error },
}

/// The contents of a persisted store after loading.
pub(crate) struct Snapshot {
    pub entries: BTreeMap<String, StoredEntry>,
    pub revision: u64,
}

pub(crate) struct RedbBackend {
    db: Database,
    path: PathBuf,
}

impl RedbBackend {
    /// Create or open the database at `path`, creating tables if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
        }

        let db = if path.exists() {
            Database::open(&path).context(OpenDatabaseSnafu { path: &path })?
        } else {
            Database::create(&path).context(OpenDatabaseSnafu { path: &path })?
        };

        let write_txn = db.begin_write().context(BeginTransactionSnafu)?;
        {
            write_txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
            write_txn.open_table(META_TABLE).context(OpenTableSnafu)?;
        }
        write_txn.commit().context(CommitSnafu)?;

        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every entry, dropping keys attached to leases.
    ///
    /// Leases live only in memory, so keys bound to them cannot outlive the
    /// process that granted them.
    pub fn load(&self) -> Result<Snapshot, StorageError> {
        let mut entries = BTreeMap::new();
        let mut orphaned = Vec::new();
        let revision;
        {
            let read_txn = self.db.begin_read().context(BeginTransactionSnafu)?;
            let kv = read_txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
            for item in kv.iter().context(AccessSnafu)? {
                let (key, value) = item.context(AccessSnafu)?;
                let key = key.value().to_string();
                let entry: StoredEntry = bincode::deserialize(value.value()).context(CodecSnafu { key: &key })?;
                if entry.lease.is_some() {
                    orphaned.push(key);
                } else {
                    entries.insert(key, entry);
                }
            }
            let meta = read_txn.open_table(META_TABLE).context(OpenTableSnafu)?;
            revision = meta.get(REVISION_KEY).context(AccessSnafu)?.map(|v| v.value()).unwrap_or(0);
        }

        if !orphaned.is_empty() {
            tracing::info!(count = orphaned.len(), "dropping lease-bound keys from previous run");
            let write_txn = self.db.begin_write().context(BeginTransactionSnafu)?;
            {
                let mut kv = write_txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
                for key in &orphaned {
                    kv.remove(key.as_str()).context(AccessSnafu)?;
                }
            }
            write_txn.commit().context(CommitSnafu)?;
        }

        Ok(Snapshot { entries, revision })
    }

    /// Durably apply `changes` (`None` deletes) and record `revision`.
    pub fn commit(&self, changes: &BTreeMap<String, Option<StoredEntry>>, revision: u64) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().context(BeginTransactionSnafu)?;
        {
            let mut kv = write_txn.open_table(KV_TABLE).context(OpenTableSnafu)?;
            for (key, change) in changes {
                match change {
                    Some(entry) => {
                        let bytes = bincode::serialize(entry).context(CodecSnafu { key })?;
                        kv.insert(key.as_str(), bytes.as_slice()).context(AccessSnafu)?;
                    }
                    None => {
                        kv.remove(key.as_str()).context(AccessSnafu)?;
                    }
                }
            }
            let mut meta = write_txn.open_table(META_TABLE).context(OpenTableSnafu)?;
            meta.insert(REVISION_KEY, revision).context(AccessSnafu)?;
        }
        write_txn.commit().context(CommitSnafu)?;
        Ok(())
    }
}
