use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use strata_interfaces::p2p::protocol::ProtocolError;
use strata_primitives::{BlockNumber, StreamId};
use tokio::sync::Notify;
use tracing::warn;

/// Where a downloaded block ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadDetails {
    /// The worker whose scratch database holds the block.
    pub worker_id: usize,
    /// The stream that served the block.
    pub stream_id: StreamId,
}

#[derive(Debug, Default)]
struct Inner {
    /// The next block number never handed to any worker.
    cursor: BlockNumber,
    /// Blocks handed to a worker and not yet resolved.
    in_flight: BTreeSet<BlockNumber>,
    /// Bookkeeping for every block a worker has stored.
    details: HashMap<BlockNumber, DownloadDetails>,
    /// Failed blocks waiting to be reassigned.
    retries: BTreeSet<BlockNumber>,
    /// Blocks delivered and written to a worker database.
    done: BTreeSet<BlockNumber>,
}

/// Per-cycle bookkeeping that partitions `(start, target]` into batches
/// and tracks their completion.
///
/// Every block number in the range is either unassigned (at or past the
/// cursor), in flight with a worker, delivered, or queued for retry; the
/// sets are disjoint. Delivered blocks are never reassigned unless a later
/// validation marks them invalid.
#[derive(Debug)]
pub struct DownloadManager {
    inner: Mutex<Inner>,
    notify: Notify,
    target: BlockNumber,
    batch_size: usize,
}

impl DownloadManager {
    /// Track downloads for `(current, target]` in batches of `batch_size`.
    pub fn new(current: BlockNumber, target: BlockNumber, batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { cursor: current + 1, ..Default::default() }),
            notify: Notify::new(),
            target,
            batch_size: batch_size.max(1),
        }
    }

    /// The height this download run ends at.
    pub fn target(&self) -> BlockNumber {
        self.target
    }

    /// Hand out the next batch of block numbers, retries first. An empty
    /// batch means nothing is assignable right now; check
    /// [`is_finished`](Self::is_finished) to tell "all delivered" from
    /// "waiting on in-flight batches".
    pub fn get_next_batch(&self) -> Vec<BlockNumber> {
        let mut inner = self.inner.lock();
        let mut batch: Vec<BlockNumber> =
            inner.retries.iter().take(self.batch_size).copied().collect();
        for bn in &batch {
            inner.retries.remove(bn);
        }
        while batch.len() < self.batch_size && inner.cursor <= self.target {
            batch.push(inner.cursor);
            inner.cursor += 1;
        }
        for bn in &batch {
            inner.in_flight.insert(*bn);
        }
        batch
    }

    /// Whether every block of the range has been delivered.
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.cursor > self.target && inner.retries.is_empty() && inner.in_flight.is_empty()
    }

    /// Wait until an in-flight batch resolves either way.
    pub async fn wait_progress(&self) {
        self.notify.notified().await;
    }

    /// Re-enqueue a failed batch for another worker.
    pub fn handle_request_error(
        &self,
        bns: &[BlockNumber],
        err: &ProtocolError,
        stream_id: Option<StreamId>,
    ) {
        warn!(target: "sync::stages::bodies", ?bns, ?stream_id, %err, "block request failed, retrying");
        let mut inner = self.inner.lock();
        for bn in bns {
            inner.in_flight.remove(bn);
            if !inner.done.contains(bn) {
                inner.retries.insert(*bn);
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Record a delivered batch.
    pub fn handle_request_result(
        &self,
        bns: &[BlockNumber],
        worker_id: usize,
        stream_id: StreamId,
    ) {
        let mut inner = self.inner.lock();
        for bn in bns {
            inner.in_flight.remove(bn);
            inner.retries.remove(bn);
            inner.details.insert(*bn, DownloadDetails { worker_id, stream_id });
            inner.done.insert(*bn);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Record where a re-downloaded block was stored.
    pub fn set_download_details(&self, bns: &[BlockNumber], worker_id: usize, stream_id: StreamId) {
        let mut inner = self.inner.lock();
        for bn in bns {
            inner.details.insert(*bn, DownloadDetails { worker_id, stream_id });
        }
    }

    /// Where the given block was stored, if it has been downloaded.
    pub fn download_details(&self, bn: BlockNumber) -> Option<DownloadDetails> {
        self.inner.lock().details.get(&bn).copied()
    }

    /// How many blocks have been delivered so far.
    pub fn downloaded_count(&self) -> usize {
        self.inner.lock().done.len()
    }
}
