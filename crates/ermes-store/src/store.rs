//! Redb-backed session store.
//!
//! Each public operation is a single redb transaction. Write operations go
//! through [`SessionStore::write`], which commits when the closure returns
//! `Ok` and drops (aborts) the transaction otherwise, so a rejected
//! request leaves no trace.

use crate::keys;
use crate::tables;
use ermes_common::{Error, KeySpaceError, NodeId, Result};
use redb::{Database, ReadableTable, Table};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, error};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("node codec error: {0}")]
    Codec(#[from] ermes_topology::CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The request was refused by the state machine
    #[error(transparent)]
    Rejected(#[from] Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<KeySpaceError> for StoreError {
    fn from(e: KeySpaceError) -> Self {
        Self::Rejected(Error::KeySpace(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rejected(inner) => inner,
            StoreError::Bincode(_) | StoreError::Codec(_) => Self::Serialization(e.to_string()),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Write-side table handle passed to write closures
pub(crate) type KvTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Read access shared by read-only and write transactions.
pub(crate) trait KvRead {
    fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Keys under `prefix` strictly after `after` (or from the start of the
    /// prefix), in key order, that satisfy `filter`, at most `limit` of them.
    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
        filter: &dyn Fn(&str) -> bool,
    ) -> StoreResult<Vec<(String, Vec<u8>)>>;

    fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get_bytes(key)?.is_some())
    }

    fn get_record<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get_bytes(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.scan(prefix, after, limit, &|_| true)
    }

    fn scan_keys(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .scan_prefix(prefix, after, limit)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }
}

impl<T: ReadableTable<&'static str, &'static [u8]>> KvRead for T {
    fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
        filter: &dyn Fn(&str) -> bool,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let after = after.filter(|after| *after >= prefix);
        let start = after.unwrap_or(prefix);
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        for entry in self.range::<&str>(start..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            if Some(key) == after || !filter(key) {
                continue;
            }
            out.push((key.to_string(), value.value().to_vec()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

/// Mutations, only available inside a write transaction.
pub(crate) trait KvWrite: KvRead {
    fn put_bytes(&mut self, key: &str, value: &[u8]) -> StoreResult<()>;

    fn delete(&mut self, key: &str) -> StoreResult<bool>;

    fn put_record<T: Serialize>(&mut self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = bincode::serialize(value)?;
        self.put_bytes(key, &bytes)
    }

    /// Delete every key under `prefix`, returning how many were removed
    fn delete_prefix(&mut self, prefix: &str) -> StoreResult<usize> {
        let keys = self.scan_keys(prefix, None, usize::MAX)?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }
}

impl KvWrite for KvTable<'_> {
    fn put_bytes(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.remove(key)?.is_some())
    }
}

/// Persistent session store backed by redb.
#[derive(Debug)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open a store that lives only in memory.
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StoreResult<Self> {
        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::KEYSPACE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Run `f` against a read-only snapshot.
    pub(crate) fn read<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&redb::ReadOnlyTable<&'static str, &'static [u8]>) -> StoreResult<R>,
    ) -> Result<R> {
        let result = (|| -> StoreResult<R> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(tables::KEYSPACE)?;
            f(&table)
        })();
        result.map_err(|e| Self::report(op, e))
    }

    /// Run `f` inside one write transaction; commit on `Ok`, abort on `Err`.
    pub(crate) fn write<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut KvTable<'_>) -> StoreResult<R>,
    ) -> Result<R> {
        let result = (|| -> StoreResult<R> {
            let write_txn = self.db.begin_write()?;
            let out = {
                let mut table = write_txn.open_table(tables::KEYSPACE)?;
                f(&mut table)?
            };
            write_txn.commit()?;
            Ok(out)
        })();
        result.map_err(|e| Self::report(op, e))
    }

    fn report(op: &'static str, e: StoreError) -> Error {
        match e {
            StoreError::Rejected(e) => {
                debug!("{} rejected: {}", op, e);
                e
            }
            e => {
                error!("{} failed: {}", op, e);
                e.into()
            }
        }
    }

    // ---- Current node ----

    /// Record the id of the local node.
    pub fn set_current_node(&self, node_id: &str) -> Result<()> {
        if node_id.is_empty() {
            return Err(Error::invalid_argument("empty node id"));
        }
        self.write("set_current_node", |t| {
            t.put_bytes(&keys::current_node(), node_id.as_bytes())
        })
    }

    /// The id of the local node.
    pub fn current_node(&self) -> Result<NodeId> {
        self.read("current_node", |t| current_node_in(t))
    }
}

/// Current node id, read inside an open transaction
pub(crate) fn current_node_in(t: &impl KvRead) -> StoreResult<NodeId> {
    match t.get_bytes(&keys::current_node())? {
        Some(bytes) => String::from_utf8(bytes)
            .map_err(|e| Error::internal(format!("corrupt current node key: {e}")).into()),
        None => Err(Error::CurrentNodeNotSet.into()),
    }
}
