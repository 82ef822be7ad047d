//! Key-value persistence layer for the ledger
//!
//! The ledger only needs three things from a store: point reads, a full scan
//! of one bucket, and an atomic multi-key write. Durability of a committed
//! batch is the store's responsibility.

use crate::error::{ChainError, Result};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Unspent outputs keyed by output id.
pub const BUCKET_UNSPENT: &str = "unspent";
/// Applied blocks keyed by big-endian sequence number.
pub const BUCKET_BLOCKS: &str = "blocks";
/// Chain metadata (head pointer).
pub const BUCKET_META: &str = "meta";

pub const META_HEAD_KEY: &[u8] = b"head";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        bucket: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: &'static str,
        key: Vec<u8>,
    },
}

/// A set of writes that must land together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bucket: &'static str, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            bucket,
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, bucket: &'static str, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            bucket,
            key: key.into(),
        });
    }

    /// Appends every operation of `other` after the ones already staged.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Abstraction for persistence backends.
pub trait Persistence: Send + Sync {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every `(key, value)` pair of a bucket, ordered by key.
    fn scan(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies the whole batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;
}

/// SQLite-backed store. All buckets share one table.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl Persistence for Database {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to read key: {}", e)))?;
        Ok(value)
    }

    fn scan(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![bucket], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to scan {}: {}", bucket, e)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?);
        }
        Ok(out)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        let tx = conn.transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        for op in batch.ops() {
            match op {
                WriteOp::Put { bucket, key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)",
                        params![bucket, key, value],
                    )
                    .map_err(|e| ChainError::DatabaseError(format!("Failed to put key: {}", e)))?;
                }
                WriteOp::Delete { bucket, key } => {
                    tx.execute(
                        "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
                        params![bucket, key],
                    )
                    .map_err(|e| {
                        ChainError::DatabaseError(format!("Failed to delete key: {}", e))
                    })?;
                }
            }
        }

        // Dropping `tx` on any error above rolls the whole batch back
        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        debug!(ops = batch.len(), "store batch committed");
        Ok(())
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryPersistence {
    buckets: RwLock<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn scan(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        // A single write lock makes the batch atomic for readers
        let mut buckets = self.buckets.write();
        for op in batch.ops {
            match op {
                WriteOp::Put { bucket, key, value } => {
                    buckets.entry(bucket.to_string()).or_default().insert(key, value);
                }
                WriteOp::Delete { bucket, key } => {
                    if let Some(b) = buckets.get_mut(bucket) {
                        b.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Persistence) {
        let mut batch = WriteBatch::new();
        batch.put(BUCKET_META, b"a".to_vec(), vec![1]);
        batch.put(BUCKET_META, b"b".to_vec(), vec![2]);
        batch.put(BUCKET_BLOCKS, b"a".to_vec(), vec![9]);
        store.write(batch).unwrap();

        assert_eq!(store.get(BUCKET_META, b"a").unwrap(), Some(vec![1]));
        assert_eq!(store.get(BUCKET_BLOCKS, b"a").unwrap(), Some(vec![9]));
        assert_eq!(store.get(BUCKET_UNSPENT, b"a").unwrap(), None);

        let mut batch = WriteBatch::new();
        batch.delete(BUCKET_META, b"a".to_vec());
        batch.put(BUCKET_META, b"b".to_vec(), vec![3]);
        store.write(batch).unwrap();

        let rows = store.scan(BUCKET_META).unwrap();
        assert_eq!(rows, vec![(b"b".to_vec(), vec![3])]);
    }

    #[test]
    fn test_database_batches() {
        let db = Database::open_in_memory().unwrap();
        exercise(&db);
    }

    #[test]
    fn test_in_memory_batches() {
        let store = InMemoryPersistence::new();
        exercise(&store);
    }

    #[test]
    fn test_scan_is_ordered_by_key() {
        let db = Database::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.put(BUCKET_BLOCKS, 2u64.to_be_bytes().to_vec(), vec![2]);
        batch.put(BUCKET_BLOCKS, 1u64.to_be_bytes().to_vec(), vec![1]);
        batch.put(BUCKET_BLOCKS, 256u64.to_be_bytes().to_vec(), vec![3]);
        db.write(batch).unwrap();

        let values: Vec<u8> = db
            .scan(BUCKET_BLOCKS)
            .unwrap()
            .into_iter()
            .map(|(_, v)| v[0])
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
