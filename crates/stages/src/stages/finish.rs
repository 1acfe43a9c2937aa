use crate::{
    error::StageError,
    id::StageId,
    stage::StageHandler,
    state::{CleanUpState, RevertState, StageState, SyncState},
};
use async_trait::async_trait;
use strata_db::{Bucket, Database, DbTxMut};

/// Clears the auxiliary buckets at the end of a cycle.
#[derive(Debug, Default)]
pub struct FinishStage;

#[async_trait]
impl StageHandler for FinishStage {
    fn id(&self) -> StageId {
        StageId::Finish
    }

    async fn exec(
        &self,
        _first_cycle: bool,
        _invalid_block_revert: bool,
        stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        let is_beacon = state.is_beacon();
        let mut tx = state.db().begin_rw()?;
        for bucket in [Bucket::BlockHashes, Bucket::ExtraBlockHashes, Bucket::DownloadedBlocks] {
            tx.clear_bucket(bucket.for_beacon(is_beacon))?;
        }
        tx.commit()?;

        let head = state.chain().current_block_number();
        if head > stage.block_number {
            state.save_stage_progress(StageId::Finish, head)?;
        }
        Ok(())
    }

    async fn revert(
        &self,
        _first_cycle: bool,
        revert: &RevertState,
        _stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        revert.done(state)
    }

    async fn clean_up(
        &self,
        _first_cycle: bool,
        cleanup: &CleanUpState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        cleanup.done(state)
    }
}
