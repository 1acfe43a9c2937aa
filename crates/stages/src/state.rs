use crate::{
    config::Config, download::DownloadManager, error::StageError, id::StageId, metrics, progress,
};
use parking_lot::{Mutex, RwLock};
use std::{fmt, sync::Arc};
use strata_db::{create_view, Database, DbTxMut};
use strata_interfaces::{chain::ChainStore, p2p::protocol::SyncProtocol};
use strata_primitives::{BlockHash, BlockNumber, StreamId};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-cycle metadata, read by many stages concurrently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCycle {
    /// Monotonic cycle number.
    pub number: u64,
    /// The height this cycle is syncing towards.
    pub target_height: BlockNumber,
}

/// The last observed invalid block and the streams that served it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidBlock {
    /// Whether a revert for this block is pending.
    pub active: bool,
    /// The offending block height.
    pub number: BlockNumber,
    /// The offending block hash.
    pub hash: BlockHash,
    /// Streams that previously delivered the bad block.
    pub stream_ids: Vec<StreamId>,
}

impl InvalidBlock {
    fn set(&mut self, number: BlockNumber, hash: BlockHash, stream_id: Option<StreamId>) {
        if self.number != number {
            self.stream_ids.clear();
        }
        self.active = true;
        self.number = number;
        self.hash = hash;
        if let Some(stream_id) = stream_id {
            if !self.stream_ids.contains(&stream_id) {
                self.stream_ids.push(stream_id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct RevertRequest {
    revert_point: Option<BlockNumber>,
    invalid_block: InvalidBlock,
}

/// A stage id together with its last persisted block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageState {
    /// The stage.
    pub id: StageId,
    /// Last persisted progress of the stage.
    pub block_number: BlockNumber,
}

/// Input to a stage's revert handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevertState {
    /// The stage being reverted.
    pub id: StageId,
    /// The height below which the stage's effects must be undone.
    pub revert_point: BlockNumber,
    /// The stage's progress when the revert was requested.
    pub current_progress: BlockNumber,
    /// Hash of the block that triggered the revert; zero for manual
    /// reverts.
    pub invalid_block_hash: BlockHash,
}

impl RevertState {
    /// Persist progress at the revert point, marking the revert done.
    pub fn done(&self, state: &SyncState) -> Result<(), StageError> {
        state.save_stage_progress(self.id, self.revert_point)
    }
}

/// Input to a stage's cleanup handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanUpState {
    /// The stage being cleaned up.
    pub id: StageId,
    /// The stage's forward progress.
    pub forward_progress: BlockNumber,
    /// Progress of the previous cleanup pass.
    pub cleanup_progress: BlockNumber,
}

impl CleanUpState {
    /// Persist cleanup progress at the forward progress.
    pub fn done(&self, state: &SyncState) -> Result<(), StageError> {
        state.save_cleanup_progress(self.id, self.forward_progress)
    }
}

/// State shared between the engine and its stage handlers.
pub struct SyncState {
    chain: Arc<dyn ChainStore>,
    db: Arc<dyn Database>,
    protocol: Arc<dyn SyncProtocol>,
    block_dbs: Vec<Arc<dyn Database>>,
    config: Config,
    is_beacon: bool,
    init_sync: bool,
    ctx: CancellationToken,
    cycle: RwLock<SyncCycle>,
    revert: Mutex<RevertRequest>,
    download_manager: Mutex<Option<Arc<DownloadManager>>>,
}

impl fmt::Debug for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncState")
            .field("shard_id", &self.chain.shard_id())
            .field("is_beacon", &self.is_beacon)
            .field("cycle", &*self.cycle.read())
            .finish()
    }
}

impl SyncState {
    pub(crate) fn new(
        chain: Arc<dyn ChainStore>,
        db: Arc<dyn Database>,
        protocol: Arc<dyn SyncProtocol>,
        block_dbs: Vec<Arc<dyn Database>>,
        config: Config,
        is_beacon: bool,
    ) -> Self {
        Self {
            chain,
            db,
            protocol,
            block_dbs,
            config,
            is_beacon,
            init_sync: true,
            ctx: CancellationToken::new(),
            cycle: RwLock::new(SyncCycle::default()),
            revert: Mutex::new(RevertRequest::default()),
            download_manager: Mutex::new(None),
        }
    }

    /// The chain store this engine syncs.
    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.chain
    }

    /// The main sync database.
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// The sync transport.
    pub fn protocol(&self) -> &Arc<dyn SyncProtocol> {
        &self.protocol
    }

    /// The per-worker scratch databases.
    pub fn block_dbs(&self) -> &[Arc<dyn Database>] {
        &self.block_dbs
    }

    pub(crate) fn set_block_dbs(&mut self, block_dbs: Vec<Arc<dyn Database>>) {
        self.block_dbs = block_dbs;
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether this engine serves the beacon shard.
    pub fn is_beacon(&self) -> bool {
        self.is_beacon
    }

    /// Whether the node is in long-range init sync mode.
    pub fn init_sync(&self) -> bool {
        self.init_sync
    }

    pub(crate) fn set_init_sync(&mut self, init_sync: bool) {
        self.init_sync = init_sync;
    }

    /// The cancellation context propagated to every stage handler.
    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    pub(crate) fn set_ctx(&mut self, ctx: CancellationToken) {
        self.ctx = ctx;
    }

    /// A copy of the current cycle metadata.
    pub fn cycle(&self) -> SyncCycle {
        *self.cycle.read()
    }

    /// The height the current cycle is syncing towards.
    pub fn target_height(&self) -> BlockNumber {
        self.cycle.read().target_height
    }

    /// Set the cycle target height.
    pub fn set_target_height(&self, target: BlockNumber) {
        self.cycle.write().target_height = target;
    }

    pub(crate) fn begin_cycle(&self) -> u64 {
        let mut cycle = self.cycle.write();
        cycle.number += 1;
        cycle.number
    }

    /// Set the pending revert to be honoured at the next loop turn.
    pub fn revert_to(&self, revert_point: BlockNumber, invalid: BlockHash) {
        info!(target: "sync::stages", revert_point, ?invalid, "reverting blocks");
        let mut revert = self.revert.lock();
        revert.revert_point = Some(revert_point);
        if invalid != BlockHash::ZERO {
            revert.invalid_block.active = true;
            revert.invalid_block.hash = invalid;
        }
    }

    /// Record an invalid block and the stream that served it.
    pub fn mark_invalid_block(
        &self,
        number: BlockNumber,
        hash: BlockHash,
        stream_id: Option<StreamId>,
    ) {
        self.revert.lock().invalid_block.set(number, hash, stream_id);
    }

    /// The pending revert point, if a revert was requested.
    pub fn pending_revert_point(&self) -> Option<BlockNumber> {
        self.revert.lock().revert_point
    }

    /// The invalid block record, kept across the revert pass so the bodies
    /// stage can blacklist the serving streams on re-download.
    pub fn invalid_block(&self) -> InvalidBlock {
        self.revert.lock().invalid_block.clone()
    }

    /// Clear the pending revert. Returns the revert point and whether the
    /// revert was caused by an invalid block.
    pub(crate) fn take_revert(&self) -> (Option<BlockNumber>, bool) {
        let mut revert = self.revert.lock();
        let point = revert.revert_point.take();
        let was_invalid = revert.invalid_block.active;
        revert.invalid_block.active = false;
        (point, was_invalid)
    }

    /// The download manager of the current (or most recent) bodies run.
    pub fn download_manager(&self) -> Option<Arc<DownloadManager>> {
        self.download_manager.lock().clone()
    }

    pub(crate) fn set_download_manager(&self, dm: Arc<DownloadManager>) {
        *self.download_manager.lock() = Some(dm);
    }

    /// Read a stage's persisted state.
    pub fn stage_state(&self, id: StageId) -> Result<StageState, StageError> {
        let block_number = self.stage_progress(id)?;
        Ok(StageState { id, block_number })
    }

    /// Read a stage's forward progress.
    pub fn stage_progress(&self, id: StageId) -> Result<BlockNumber, StageError> {
        let is_beacon = self.is_beacon;
        Ok(create_view(self.db.as_ref(), None, |tx| {
            progress::get_stage_progress(tx, id, is_beacon)
        })?)
    }

    /// Persist a stage's forward progress.
    pub fn save_stage_progress(
        &self,
        id: StageId,
        progress: BlockNumber,
    ) -> Result<(), StageError> {
        let mut tx = self.db.begin_rw().map_err(StageError::SaveProgressFailed)?;
        progress::save_stage_progress(tx.as_mut(), id, self.is_beacon, progress)
            .map_err(StageError::SaveProgressFailed)?;
        tx.commit().map_err(StageError::SaveProgressFailed)?;
        metrics::record_checkpoint(id, progress);
        Ok(())
    }

    /// Read a stage's cleanup progress.
    pub fn cleanup_progress(&self, id: StageId) -> Result<BlockNumber, StageError> {
        let is_beacon = self.is_beacon;
        Ok(create_view(self.db.as_ref(), None, |tx| {
            progress::get_cleanup_progress(tx, id, is_beacon)
        })?)
    }

    /// Persist a stage's cleanup progress.
    pub fn save_cleanup_progress(
        &self,
        id: StageId,
        progress: BlockNumber,
    ) -> Result<(), StageError> {
        let mut tx = self.db.begin_rw().map_err(StageError::SaveProgressFailed)?;
        progress::save_cleanup_progress(tx.as_mut(), id, self.is_beacon, progress)
            .map_err(StageError::SaveProgressFailed)?;
        tx.commit().map_err(StageError::SaveProgressFailed)?;
        Ok(())
    }
}
