use crate::{error::DbResult, tables::Bucket};
use std::fmt;
use strata_primitives::Bytes;

/// Read access to a consistent view of the store.
pub trait DbTx: Send {
    /// Get a value by key from the given bucket.
    fn get(&self, bucket: Bucket, key: &[u8]) -> DbResult<Option<Bytes>>;

    /// Total size in bytes of the entries of the given bucket.
    fn bucket_size(&self, bucket: Bucket) -> DbResult<u64>;

    /// Flush backend-internal metrics. Backends without metrics do nothing.
    fn collect_metrics(&self) {}
}

/// Write access to the store. Writes become visible on
/// [`commit`](DbTxMut::commit).
pub trait DbTxMut: DbTx {
    /// Put a value under a key in the given bucket.
    fn put(&mut self, bucket: Bucket, key: &[u8], value: Bytes) -> DbResult<()>;

    /// Delete a key from the given bucket.
    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> DbResult<()>;

    /// Drop every entry of the given bucket.
    fn clear_bucket(&mut self, bucket: Bucket) -> DbResult<()>;

    /// Commit the transaction.
    fn commit(self: Box<Self>) -> DbResult<()>;

    /// Drop the transaction without applying its writes.
    fn rollback(self: Box<Self>);
}

/// A transactional ordered-bucket store.
pub trait Database: Send + Sync + fmt::Debug {
    /// Begin a read-only transaction.
    fn begin_ro(&self) -> DbResult<Box<dyn DbTx + '_>>;

    /// Begin a read-write transaction.
    fn begin_rw(&self) -> DbResult<Box<dyn DbTxMut + '_>>;
}

/// Run `f` against the passed transaction if one is given, else against a
/// short-lived read transaction.
pub fn create_view<T>(
    db: &dyn Database,
    tx: Option<&dyn DbTx>,
    f: impl FnOnce(&dyn DbTx) -> DbResult<T>,
) -> DbResult<T> {
    match tx {
        Some(tx) => f(tx),
        None => {
            let view = db.begin_ro()?;
            f(view.as_ref())
        }
    }
}
