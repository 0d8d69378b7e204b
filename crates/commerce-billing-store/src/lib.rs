//! Storage layer for commerce-billing.
//!
//! The billing engine consumes persistence through the [`Store`] trait: raw reads and scans
//! per entity kind, atomic batch commits, and a writer lock. [`StoreExt`] layers typed access
//! on top of any `Store`, including `dyn Store`.
//!
//! # Architecture
//!
//! - Each [`Entity`] kind is a namespace (a column family in `RocksDB`), see [`schema::kind`].
//! - Values are CBOR-encoded; keys are the entity's string key.
//! - [`StoreExt::transaction`] serializes writers behind the store's writer lock, stages
//!   writes (reads inside the transaction see them) and commits them in one atomic batch.
//!
//! # Example
//!
//! ```
//! use commerce_billing_core::{AggregationType, Meter, MeterId};
//! use commerce_billing_store::{MemoryStore, StoreError, StoreExt};
//!
//! let store = MemoryStore::new();
//! let meter = Meter::new(MeterId::from("mtr_api"), "API calls", AggregationType::Count, "usd");
//! store.create(&meter).unwrap();
//!
//! let count = store
//!     .transaction(|tx| {
//!         let mut meter: Meter = tx.require("mtr_api")?;
//!         meter.metadata.insert("team".into(), "platform".into());
//!         tx.update(&meter)?;
//!         Ok::<_, StoreError>(meter.metadata.len())
//!     })
//!     .unwrap();
//! assert_eq!(count, 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

use std::collections::BTreeMap;
use std::sync::MutexGuard;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;
pub use schema::{all_kinds, kind, Entity, Sequence};

/// A single staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace a record.
    Put {
        /// Entity kind.
        kind: &'static str,
        /// Record key.
        key: String,
        /// Encoded value.
        value: Vec<u8>,
    },
    /// Remove a record.
    Delete {
        /// Entity kind.
        kind: &'static str,
        /// Record key.
        key: String,
    },
}

/// Writes applied atomically by [`Store::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Stage a put.
    pub fn put(&mut self, kind: &'static str, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            kind,
            key: key.into(),
            value,
        });
    }

    /// Stage a delete.
    pub fn delete(&mut self, kind: &'static str, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete {
            kind,
            key: key.into(),
        });
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of staged writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The staged writes in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// The storage trait defining the raw operations a backend provides.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing). Typed access lives in [`StoreExt`].
pub trait Store: Send + Sync {
    /// Read one encoded record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_raw(&self, kind: &'static str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read every record of a kind in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn scan_raw(&self, kind: &'static str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails; nothing is applied then.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Acquire the writer lock. Read-modify-write sequences hold it until they commit.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockPoisoned` if a previous writer panicked.
    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>>;
}

/// Typed operations over any [`Store`].
pub trait StoreExt: Store {
    /// Get an entity by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decoding fails.
    fn get<E: Entity>(&self, key: &str) -> Result<Option<E>> {
        self.get_raw(E::KIND, key)?
            .map(|data| keys::decode_value(&data))
            .transpose()
    }

    /// Get an entity by key, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the entity does not exist.
    fn require<E: Entity>(&self, key: &str) -> Result<E> {
        self.get(key)?.ok_or_else(|| StoreError::NotFound {
            kind: E::KIND,
            id: key.to_string(),
        })
    }

    /// Get every entity of a kind in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or decoding fails.
    fn get_all<E: Entity>(&self) -> Result<Vec<E>> {
        self.scan_raw(E::KIND)?
            .into_iter()
            .map(|(_, data)| keys::decode_value(&data))
            .collect()
    }

    /// Get every entity of a kind matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or decoding fails.
    fn query<E: Entity>(&self, filter: impl Fn(&E) -> bool) -> Result<Vec<E>> {
        Ok(self.get_all::<E>()?.into_iter().filter(|e| filter(e)).collect())
    }

    /// Insert a new entity.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the key is taken.
    fn create<E: Entity>(&self, entity: &E) -> Result<()> {
        self.transaction(|tx| tx.create(entity))
    }

    /// Replace an existing entity.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the entity does not exist.
    fn update<E: Entity>(&self, entity: &E) -> Result<()> {
        self.transaction(|tx| tx.update(entity))
    }

    /// Insert or replace an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put<E: Entity>(&self, entity: &E) -> Result<()> {
        self.transaction(|tx| tx.put(entity))
    }

    /// Run `f` as one atomic unit.
    ///
    /// The writer lock is held for the whole call. Writes made through the transaction are
    /// visible to its own reads and are committed together only if `f` returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or the storage error raised while locking/committing.
    fn transaction<R, Err, F>(&self, f: F) -> std::result::Result<R, Err>
    where
        F: FnOnce(&mut Transaction<'_, Self>) -> std::result::Result<R, Err>,
        Err: From<StoreError>,
    {
        let _guard = self.lock_writer()?;
        let mut tx = Transaction::new(self);
        let output = f(&mut tx)?;
        let batch = tx.into_batch();
        if !batch.is_empty() {
            self.commit(batch)?;
        }
        Ok(output)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Staged reads and writes inside [`StoreExt::transaction`].
pub struct Transaction<'a, S: ?Sized> {
    store: &'a S,
    staged: BTreeMap<(&'static str, String), Option<Vec<u8>>>,
}

impl<'a, S: Store + ?Sized> Transaction<'a, S> {
    fn new(store: &'a S) -> Self {
        Self {
            store,
            staged: BTreeMap::new(),
        }
    }

    fn raw(&self, kind: &'static str, key: &str) -> Result<Option<Vec<u8>>> {
        match self.staged.get(&(kind, key.to_string())) {
            Some(staged) => Ok(staged.clone()),
            None => self.store.get_raw(kind, key),
        }
    }

    fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::default();
        for ((kind, key), value) in self.staged {
            match value {
                Some(value) => batch.put(kind, key, value),
                None => batch.delete(kind, key),
            }
        }
        batch
    }

    /// Get an entity by key, seeing staged writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decoding fails.
    pub fn get<E: Entity>(&self, key: &str) -> Result<Option<E>> {
        self.raw(E::KIND, key)?
            .map(|data| keys::decode_value(&data))
            .transpose()
    }

    /// Get an entity by key, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the entity does not exist.
    pub fn require<E: Entity>(&self, key: &str) -> Result<E> {
        self.get(key)?.ok_or_else(|| StoreError::NotFound {
            kind: E::KIND,
            id: key.to_string(),
        })
    }

    /// Get every entity of a kind in key order, seeing staged writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or decoding fails.
    pub fn get_all<E: Entity>(&self) -> Result<Vec<E>> {
        let mut rows: BTreeMap<String, Vec<u8>> =
            self.store.scan_raw(E::KIND)?.into_iter().collect();
        for ((kind, key), value) in &self.staged {
            if *kind != E::KIND {
                continue;
            }
            match value {
                Some(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        rows.values().map(|data| keys::decode_value(data)).collect()
    }

    /// Get every entity of a kind matching `filter`, seeing staged writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or decoding fails.
    pub fn query<E: Entity>(&self, filter: impl Fn(&E) -> bool) -> Result<Vec<E>> {
        Ok(self.get_all::<E>()?.into_iter().filter(|e| filter(e)).collect())
    }

    /// Stage an insert-or-replace.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity cannot be encoded.
    pub fn put<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let value = keys::encode_value(entity)?;
        self.staged.insert((E::KIND, entity.key()), Some(value));
        Ok(())
    }

    /// Stage an insert of a new entity.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the key is taken.
    pub fn create<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let key = entity.key();
        if self.raw(E::KIND, &key)?.is_some() {
            return Err(StoreError::AlreadyExists { kind: E::KIND, id: key });
        }
        self.put(entity)
    }

    /// Stage a replacement of an existing entity.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the entity does not exist.
    pub fn update<E: Entity>(&mut self, entity: &E) -> Result<()> {
        let key = entity.key();
        if self.raw(E::KIND, &key)?.is_none() {
            return Err(StoreError::NotFound { kind: E::KIND, id: key });
        }
        self.put(entity)
    }

    /// Stage a delete.
    pub fn delete<E: Entity>(&mut self, key: &str) {
        self.staged.insert((E::KIND, key.to_string()), None);
    }

    /// Increment the named sequence and return its new value, starting at 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence cannot be read or encoded.
    pub fn next_sequence(&mut self, name: &str) -> Result<u64> {
        let mut sequence = self.get::<Sequence>(name)?.unwrap_or_else(|| Sequence {
            name: name.to_string(),
            value: 0,
        });
        sequence.value += 1;
        self.put(&sequence)?;
        Ok(sequence.value)
    }
}
