use crate::{
    error::StageError,
    id::StageId,
    stage::StageHandler,
    stages::REQUEST_TIMEOUT,
    state::{CleanUpState, RevertState, StageState, SyncState},
};
use async_trait::async_trait;
use strata_interfaces::p2p::{error::RequestError, options::RequestOptions};
use tracing::info;

/// Determines the cycle target height from a peer head probe.
#[derive(Debug, Default)]
pub struct HeadsStage;

#[async_trait]
impl StageHandler for HeadsStage {
    fn id(&self) -> StageId {
        StageId::Heads
    }

    async fn exec(
        &self,
        _first_cycle: bool,
        invalid_block_revert: bool,
        stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        if !state.init_sync() {
            return Ok(())
        }
        if invalid_block_revert {
            // The target of the interrupted cycle still stands.
            return Ok(())
        }

        let current_head = state.chain().current_block_number();
        let probe = tokio::select! {
            _ = state.ctx().cancelled() => return Err(StageError::Cancelled),
            res = tokio::time::timeout(
                REQUEST_TIMEOUT,
                state
                    .protocol()
                    .get_current_block_number(RequestOptions::new().with_high_priority()),
            ) => match res {
                Ok(Ok((head, _stream_id))) => head,
                Ok(Err(err)) => return Err(StageError::Request(err.kind)),
                Err(_) => return Err(StageError::Request(RequestError::Timeout)),
            },
        };

        let target = probe.max(current_head);
        state.set_target_height(target);
        info!(target: "sync::stages::heads", current_head, cycle_target = target, "cycle target set");

        if target > stage.block_number {
            state.save_stage_progress(StageId::Heads, target)?;
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
