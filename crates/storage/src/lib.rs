//! arbiter-storage: the document store interface the evaluator reads
//! through.
//!
//! The evaluator treats storage as a stable, read-only key-path tree for
//! the duration of one query. Implementations provide transactional
//! reads; the in-memory store here backs tests and embedders that load
//! documents up front.

mod error;
mod memory;
mod path;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use path::StorePath;

/// A transaction handle. Stores hand these out at `begin_read` and
/// accept them back on every read until `abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transaction(pub u64);

/// Read-only key-path access to a JSON-like document tree.
///
/// ## Lifecycle
///
/// 1. `begin_read()` -- open a read transaction
/// 2. `read(&txn, &path)` any number of times
/// 3. `abort(txn)` -- release the transaction
///
/// Reads within one transaction must observe a consistent snapshot.
/// Implementations must be `Send + Sync`; a store may serve many
/// concurrent queries, each holding its own transaction.
pub trait Store: Send + Sync {
    /// Open a read transaction.
    fn begin_read(&self) -> Result<Transaction, StorageError>;

    /// Read the document at `path`. Missing paths return
    /// [`StorageError::NotFound`].
    fn read(&self, txn: &Transaction, path: &StorePath) -> Result<serde_json::Value, StorageError>;

    /// Release a transaction.
    fn abort(&self, txn: Transaction);
}
