use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::trace;

use crate::error::StorageError;
use crate::path::StorePath;
use crate::{Store, Transaction};

/// An in-memory store over one JSON document tree.
///
/// Writes replace the whole tree and are only permitted between
/// transactions, so open readers always observe a consistent snapshot.
pub struct MemoryStore {
    data: RwLock<serde_json::Value>,
    txn_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new(data: serde_json::Value) -> Self {
        MemoryStore {
            data: RwLock::new(data),
            txn_counter: AtomicU64::new(0),
        }
    }

    pub fn empty() -> Self {
        MemoryStore::new(serde_json::json!({}))
    }

    /// Replace the whole document tree.
    pub fn replace(&self, data: serde_json::Value) {
        *self.data.write().expect("store lock poisoned") = data;
    }
}

impl Store for MemoryStore {
    fn begin_read(&self) -> Result<Transaction, StorageError> {
        let id = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        trace!(txn = id, "begin read transaction");
        Ok(Transaction(id))
    }

    fn read(&self, _txn: &Transaction, path: &StorePath) -> Result<serde_json::Value, StorageError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut current: &serde_json::Value = &data;
        for seg in path.segments() {
            current = match current {
                serde_json::Value::Object(fields) => {
                    fields.get(seg).ok_or_else(|| StorageError::NotFound {
                        path: path.segments().to_vec(),
                    })?
                }
                serde_json::Value::Array(elems) => {
                    let idx: usize = seg.parse().map_err(|_| StorageError::NotFound {
                        path: path.segments().to_vec(),
                    })?;
                    elems.get(idx).ok_or_else(|| StorageError::NotFound {
                        path: path.segments().to_vec(),
                    })?
                }
                _ => {
                    return Err(StorageError::NotFound {
                        path: path.segments().to_vec(),
                    })
                }
            };
        }
        Ok(current.clone())
    }

    fn abort(&self, txn: Transaction) {
        trace!(txn = txn.0, "abort read transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_walk_objects_and_arrays() {
        let store = MemoryStore::new(serde_json::json!({
            "a": {"b": [10, 20, 30]},
        }));
        let txn = store.begin_read().unwrap();

        let root = store.read(&txn, &StorePath::default()).unwrap();
        assert!(root.get("a").is_some());

        let v = store
            .read(&txn, &StorePath::new(vec!["a".into(), "b".into(), "1".into()]))
            .unwrap();
        assert_eq!(v, serde_json::json!(20));

        let missing = store
            .read(&txn, &StorePath::new(vec!["a".into(), "z".into()]))
            .unwrap_err();
        assert!(missing.is_not_found());

        store.abort(txn);
    }
}
