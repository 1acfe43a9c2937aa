//! In-memory store backend.
//!
//! Backs worker scratch databases when the engine runs with in-memory
//! scratch space, and every test in the workspace.

use crate::{
    database::{Database, DbTx, DbTxMut},
    error::DbResult,
    tables::Bucket,
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};
use strata_primitives::Bytes;

type BucketMap = BTreeMap<Vec<u8>, Bytes>;
type Snapshot = HashMap<Bucket, Arc<BucketMap>>;

/// An in-memory ordered-bucket store.
///
/// Read transactions observe a snapshot taken at [`begin_ro`]; write
/// transactions buffer their changes and apply them on commit under the
/// store's write lock. Cloning shares the underlying buckets.
///
/// [`begin_ro`]: Database::begin_ro
#[derive(Clone, Default)]
pub struct MemDb {
    buckets: Arc<RwLock<Snapshot>>,
}

impl MemDb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDb").field("buckets", &self.buckets.read().len()).finish()
    }
}

impl Database for MemDb {
    fn begin_ro(&self) -> DbResult<Box<dyn DbTx + '_>> {
        Ok(Box::new(MemTx { snapshot: self.buckets.read().clone() }))
    }

    fn begin_rw(&self) -> DbResult<Box<dyn DbTxMut + '_>> {
        Ok(Box::new(MemTxMut {
            db: self,
            snapshot: self.buckets.read().clone(),
            writes: HashMap::new(),
            cleared: HashSet::new(),
        }))
    }
}

fn snapshot_get(snapshot: &Snapshot, bucket: Bucket, key: &[u8]) -> Option<Bytes> {
    snapshot.get(&bucket).and_then(|entries| entries.get(key).cloned())
}

fn entries_size(entries: &BucketMap) -> u64 {
    entries.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
}

struct MemTx {
    snapshot: Snapshot,
}

impl DbTx for MemTx {
    fn get(&self, bucket: Bucket, key: &[u8]) -> DbResult<Option<Bytes>> {
        Ok(snapshot_get(&self.snapshot, bucket, key))
    }

    fn bucket_size(&self, bucket: Bucket) -> DbResult<u64> {
        Ok(self.snapshot.get(&bucket).map_or(0, |entries| entries_size(entries)))
    }
}

struct MemTxMut<'a> {
    db: &'a MemDb,
    snapshot: Snapshot,
    /// Buffered writes; `None` marks a deletion.
    writes: HashMap<Bucket, BTreeMap<Vec<u8>, Option<Bytes>>>,
    cleared: HashSet<Bucket>,
}

impl MemTxMut<'_> {
    /// The bucket contents as they would look after commit.
    fn effective(&self, bucket: Bucket) -> BucketMap {
        let mut entries = if self.cleared.contains(&bucket) {
            BucketMap::new()
        } else {
            self.snapshot.get(&bucket).map(|e| (**e).clone()).unwrap_or_default()
        };
        if let Some(writes) = self.writes.get(&bucket) {
            for (key, value) in writes {
                match value {
                    Some(value) => {
                        entries.insert(key.clone(), value.clone());
                    }
                    None => {
                        entries.remove(key);
                    }
                }
            }
        }
        entries
    }
}

impl DbTx for MemTxMut<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> DbResult<Option<Bytes>> {
        if let Some(writes) = self.writes.get(&bucket) {
            if let Some(value) = writes.get(key) {
                return Ok(value.clone())
            }
        }
        if self.cleared.contains(&bucket) {
            return Ok(None)
        }
        Ok(snapshot_get(&self.snapshot, bucket, key))
    }

    fn bucket_size(&self, bucket: Bucket) -> DbResult<u64> {
        Ok(entries_size(&self.effective(bucket)))
    }
}

impl DbTxMut for MemTxMut<'_> {
    fn put(&mut self, bucket: Bucket, key: &[u8], value: Bytes) -> DbResult<()> {
        self.writes.entry(bucket).or_default().insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, bucket: Bucket, key: &[u8]) -> DbResult<()> {
        self.writes.entry(bucket).or_default().insert(key.to_vec(), None);
        Ok(())
    }

    fn clear_bucket(&mut self, bucket: Bucket) -> DbResult<()> {
        self.writes.remove(&bucket);
        self.cleared.insert(bucket);
        Ok(())
    }

    fn commit(self: Box<Self>) -> DbResult<()> {
        let MemTxMut { db, writes, cleared, .. } = *self;
        let mut buckets = db.buckets.write();
        for bucket in cleared {
            buckets.insert(bucket, Arc::new(BucketMap::new()));
        }
        for (bucket, entries) in writes {
            let target = Arc::make_mut(buckets.entry(bucket).or_default());
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        target.insert(key, value);
                    }
                    None => {
                        target.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}
