//! In-memory [`Storage`] backend for testing.
//!
//! Clones share the same underlying data, so dropping an engine and building
//! a new one over a clone of the same `MemoryStorage` simulates a restart.
//! Nothing survives the process exiting.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Namespace, Storage, StoreError, WriteBatch, WriteOp};

/// Shared in-process key-value store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    /// Records per namespace, kept in insertion order.
    tables: Arc<Mutex<HashMap<Namespace, Vec<(String, Vec<u8>)>>>>,
}

impl MemoryStorage {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records in a namespace.
    #[must_use]
    pub fn len(&self, ns: Namespace) -> usize {
        self.tables.lock().get(&ns).map_or(0, Vec::len)
    }

    /// Returns `true` if a namespace holds no records.
    #[must_use]
    pub fn is_empty(&self, ns: Namespace) -> bool {
        self.len(ns) == 0
    }
}

impl Storage for MemoryStorage {
    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self.tables.lock().get(&ns).cloned().unwrap_or_default())
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tables.lock().get(&ns).and_then(|rows| {
            rows.iter()
                .find(|(k, _)| k == key)
                .map(|(_, value)| value.clone())
        }))
    }

    async fn write_batch(&self, ns: Namespace, batch: WriteBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let rows = tables.entry(ns).or_default();
        if batch.clear {
            rows.clear();
        }
        for op in batch.ops {
            match op {
                WriteOp::Put(key, value) => {
                    if let Some(slot) = rows.iter_mut().find(|(k, _)| *k == key) {
                        slot.1 = value;
                    } else {
                        rows.push((key, value));
                    }
                }
                WriteOp::Delete(key) => rows.retain(|(k, _)| *k != key),
            }
        }
        drop(tables);
        Ok(())
    }
}
