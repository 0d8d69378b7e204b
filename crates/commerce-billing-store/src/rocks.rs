//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait. Every entity
//! kind gets its own column family; batches are written with a single `WriteBatch`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch as RocksBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::all_kinds;
use crate::{BatchOp, Store, WriteBatch};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    writer: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_kinds()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!(path = %path.as_ref().display(), "Opened RocksDB store");

        Ok(Self {
            db: Arc::new(db),
            writer: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }
}

impl Store for RocksStore {
    fn get_raw(&self, kind: &'static str, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(kind)?;
        self.db
            .get_cf(&cf, keys::encode_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn scan_raw(&self, kind: &'static str) -> Result<Vec<(String, Vec<u8>)>> {
        let cf = self.cf(kind)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            rows.push((keys::decode_key(&key)?, value.to_vec()));
        }
        Ok(rows)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut rocks_batch = RocksBatch::default();
        for op in batch.ops() {
            match op {
                BatchOp::Put { kind, key, value } => {
                    let cf = self.cf(kind)?;
                    rocks_batch.put_cf(&cf, keys::encode_key(key), value);
                }
                BatchOp::Delete { kind, key } => {
                    let cf = self.cf(kind)?;
                    rocks_batch.delete_cf(&cf, keys::encode_key(key));
                }
            }
        }

        self.db
            .write(rocks_batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sequence, StoreExt};
    use commerce_billing_core::{AggregationType, Meter, MeterId};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn entity_crud() {
        let (store, _dir) = create_test_store();
        let meter = Meter::new(MeterId::from("mtr_a"), "A", AggregationType::Sum, "usd");

        store.create(&meter).unwrap();
        assert!(store.create(&meter).is_err());

        let retrieved: Meter = store.require("mtr_a").unwrap();
        assert_eq!(retrieved, meter);

        store
            .transaction(|tx| {
                tx.delete::<Meter>("mtr_a");
                tx.next_sequence("credit-note").map(|_| ())
            })
            .unwrap();
        assert!(store.get::<Meter>("mtr_a").unwrap().is_none());
        assert_eq!(store.require::<Sequence>("credit-note").unwrap().value, 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            for id in ["mtr_b", "mtr_a"] {
                store
                    .put(&Meter::new(MeterId::from(id), id, AggregationType::Count, "usd"))
                    .unwrap();
            }
        }
        let store = RocksStore::open(dir.path()).unwrap();
        let ids: Vec<_> = store
            .get_all::<Meter>()
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, ["mtr_a", "mtr_b"]);
    }
}
