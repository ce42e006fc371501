//! Scalar store: the authoritative id → JSON document mapping.
//!
//! Backed by [redb](https://docs.rs/redb), a pure Rust embedded ordered
//! key-value store with single-writer / multi-reader MVCC and crash
//! recovery. One table maps string keys to raw bytes; records are keyed by
//! the decimal form of their id and valued by the canonical one-line JSON
//! serialization.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tracing::debug;

use crate::error::{DbError, Result};

const SCALARS: TableDefinition<&str, &[u8]> = TableDefinition::new("scalars");

pub struct ScalarStore {
    db: Database,
    path: PathBuf,
}

impl ScalarStore {
    /// Open (or create) the store. Refusal to open is fatal at bootstrap.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::StoreOpen {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
        }

        let db = Database::create(path).map_err(|e| DbError::StoreOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Create the table up front so reads never see a missing table.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SCALARS)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "scalar store opened");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total overwrite of `key`.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SCALARS)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCALARS)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Serialize `doc` canonically and store it under the record's id.
    pub fn insert_scalar(&self, id: u64, doc: &Value) -> Result<()> {
        let value = serde_json::to_vec(doc)?;
        self.put(&id.to_string(), &value)
    }

    /// The stored document for `id`, or `Value::Null` when absent.
    pub fn get_scalar(&self, id: u64) -> Result<Value> {
        match self.get(&id.to_string())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ScalarStore::open(dir.path().join("scalar.redb")).unwrap();

        store.put("k", b"hello").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"hello");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_existing_value() {
        let dir = tempdir().unwrap();
        let store = ScalarStore::open(dir.path().join("scalar.redb")).unwrap();

        store.put("k", b"one").unwrap();
        store.put("k", b"two").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"two");
    }

    #[test]
    fn scalar_roundtrip_and_absent_is_null() {
        let dir = tempdir().unwrap();
        let store = ScalarStore::open(dir.path().join("scalar.redb")).unwrap();

        let doc = json!({"id": 7, "vectors": [0.1, 0.2], "category": 3});
        store.insert_scalar(7, &doc).unwrap();

        assert_eq!(store.get_scalar(7).unwrap(), doc);
        assert_eq!(store.get_scalar(8).unwrap(), Value::Null);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scalar.redb");

        let doc = json!({"id": 1, "tag": "persisted"});
        {
            let store = ScalarStore::open(&path).unwrap();
            store.insert_scalar(1, &doc).unwrap();
        }

        let store = ScalarStore::open(&path).unwrap();
        assert_eq!(store.get_scalar(1).unwrap(), doc);
    }
}
