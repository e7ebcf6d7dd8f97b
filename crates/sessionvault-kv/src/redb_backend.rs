//! Persistent key-value backend backed by redb.
//!
//! Every write is synchronous (write txn + commit). Reads go through the
//! engine's cache and read-through path; this module only handles
//! persistence.

use crate::backend::{KvBackend, KvTransaction};
use crate::error::KvResult;
use crate::tables;
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Persistent key-value store backed by redb.
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::ENTRIES)?;
        }
        write_txn.commit()?;

        info!("Opened redb backend at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    /// Number of stored keys
    pub fn len(&self) -> KvResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> KvResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys starting with `prefix`, in key order
    ///
    /// Diagnostic helper; the engine itself never enumerates the namespace.
    pub fn keys_with_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        let mut keys = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, _) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

impl KvBackend for RedbBackend {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> KvResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ENTRIES)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ENTRIES)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn begin_transaction(&self) -> KvResult<Box<dyn KvTransaction>> {
        Ok(Box::new(RedbTransaction {
            db: Arc::clone(&self.db),
            ops: Vec::new(),
        }))
    }
}

/// Buffered ops applied in a single redb write transaction on commit
struct RedbTransaction {
    db: Arc<Database>,
    ops: Vec<(String, Option<Vec<u8>>)>,
}

impl RedbTransaction {
    fn write_all(&self) -> KvResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ENTRIES)?;
            for (key, value) in &self.ops {
                match value {
                    Some(bytes) => {
                        table.insert(key.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(key.as_str())?;
                    }
                }
            }
        }
        // Dropping an uncommitted write txn aborts it, so an error above
        // leaves the database untouched.
        write_txn.commit()?;
        Ok(())
    }
}

impl KvTransaction for RedbTransaction {
    fn save(&mut self, key: &str, value: &[u8]) {
        self.ops.push((key.to_string(), Some(value.to_vec())));
    }

    fn remove(&mut self, key: &str) {
        self.ops.push((key.to_string(), None));
    }

    fn commit(self: Box<Self>) -> KvResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.write_all()?;
        debug!("committed redb transaction with {} ops", self.ops.len());
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!("rolled back redb transaction with {} ops", self.ops.len());
    }
}
