//! In-memory storage implementation.
//!
//! Used by tests and by deployments that do not need durability. Values are CBOR-encoded
//! exactly as in `RocksDB`, so both backends behave the same for every entity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::error::{Result, StoreError};
use crate::{BatchOp, Store, WriteBatch};

type Tables = HashMap<&'static str, BTreeMap<String, Vec<u8>>>;

/// In-memory storage implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    writer: Mutex<()>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_raw(&self, kind: &'static str, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.get(kind).and_then(|table| table.get(key)).cloned())
    }

    fn scan_raw(&self, kind: &'static str) -> Result<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables
            .get(kind)
            .map(|table| {
                table
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        for op in batch.ops() {
            match op {
                BatchOp::Put { kind, key, value } => {
                    tables
                        .entry(kind)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                BatchOp::Delete { kind, key } => {
                    if let Some(table) = tables.get_mut(kind) {
                        table.remove(key);
                    }
                }
            }
        }
        Ok(())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Sequence, StoreExt};
    use chrono::Utc;
    use commerce_billing_core::{
        AggregationType, CustomerBalance, CustomerId, Meter, MeterId,
    };
    use std::sync::Arc;

    fn meter(id: &str) -> Meter {
        Meter::new(MeterId::from(id), id, AggregationType::Sum, "usd")
    }

    #[test]
    fn create_get_update() {
        let store = MemoryStore::new();
        store.create(&meter("mtr_a")).unwrap();
        assert!(matches!(
            store.create(&meter("mtr_a")),
            Err(StoreError::AlreadyExists { .. })
        ));

        let mut m: Meter = store.require("mtr_a").unwrap();
        m.metadata.insert("k".into(), "v".into());
        store.update(&m).unwrap();
        assert_eq!(store.require::<Meter>("mtr_a").unwrap().metadata["k"], "v");

        assert!(matches!(
            store.update(&meter("mtr_missing")),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.get::<Meter>("mtr_missing").unwrap().is_none());
    }

    #[test]
    fn get_all_in_key_order_and_query() {
        let store = MemoryStore::new();
        for id in ["mtr_c", "mtr_a", "mtr_b"] {
            store.put(&meter(id)).unwrap();
        }
        let ids: Vec<_> = store
            .get_all::<Meter>()
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, ["mtr_a", "mtr_b", "mtr_c"]);

        let filtered = store.query::<Meter>(|m| m.id.as_str() != "mtr_b").unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = MemoryStore::new();
        let seen = store
            .transaction(|tx| {
                tx.put(&meter("mtr_a"))?;
                let inside = tx.get_all::<Meter>()?.len();
                tx.delete::<Meter>("mtr_a");
                let after_delete = tx.get::<Meter>("mtr_a")?.is_none();
                tx.put(&meter("mtr_b"))?;
                Ok::<_, StoreError>((inside, after_delete))
            })
            .unwrap();
        assert_eq!(seen, (1, true));
        assert!(store.get::<Meter>("mtr_a").unwrap().is_none());
        assert!(store.get::<Meter>("mtr_b").unwrap().is_some());
    }

    #[test]
    fn failed_transaction_commits_nothing() {
        let store = MemoryStore::new();
        let result: std::result::Result<(), StoreError> = store.transaction(|tx| {
            tx.put(&meter("mtr_a"))?;
            tx.update(&meter("mtr_missing"))
        });
        assert!(result.is_err());
        assert!(store.get_all::<Meter>().unwrap().is_empty());
    }

    #[test]
    fn sequences_start_at_one() {
        let store = MemoryStore::new();
        let first = store.transaction(|tx| tx.next_sequence("credit-note")).unwrap();
        let second = store.transaction(|tx| tx.next_sequence("credit-note")).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(store.require::<Sequence>("credit-note").unwrap().value, 2);
    }

    #[test]
    fn concurrent_read_modify_write_is_serialized() {
        let store = Arc::new(MemoryStore::new());
        let customer = CustomerId::from("cus_1");
        store
            .put(&CustomerBalance::new(customer.clone(), "usd", Utc::now()))
            .unwrap();
        let key = CustomerBalance::key_for(&customer, "usd");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .transaction(|tx| {
                                let mut balance: CustomerBalance = tx.require(&key)?;
                                balance.balance += 1;
                                tx.update(&balance)
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.require::<CustomerBalance>(&key).unwrap().balance, 200);
    }

    #[test]
    fn works_through_dyn_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.create(&meter("mtr_a")).unwrap();
        let n = store
            .transaction(|tx| Ok::<_, StoreError>(tx.get_all::<Meter>()?.len()))
            .unwrap();
        assert_eq!(n, 1);
    }
}
