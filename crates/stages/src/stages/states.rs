use crate::{
    download::DownloadDetails,
    error::StageError,
    id::StageId,
    stage::StageHandler,
    state::{CleanUpState, RevertState, StageState, SyncState},
};
use alloy_rlp::Decodable;
use async_trait::async_trait;
use strata_db::{block_number_key, Bucket, Database, DbTx};
use strata_interfaces::chain::ChainError;
use strata_primitives::{Block, BlockHash, BlockNumber, Bytes};
use tracing::{info, warn};

/// Verifies downloaded blocks and inserts them into the chain store.
///
/// Walks the cycle's height range in order, resolving each block's worker
/// scratch database through the download manager. A block that fails
/// validation is recorded as invalid together with its serving stream and
/// sets the revert point; the stage then returns successfully so the engine
/// can run the revert pass.
#[derive(Debug, Default)]
pub struct StatesStage;

#[async_trait]
impl StageHandler for StatesStage {
    fn id(&self) -> StageId {
        StageId::States
    }

    async fn exec(
        &self,
        _first_cycle: bool,
        _invalid_block_revert: bool,
        _stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        if !state.init_sync() {
            return Ok(())
        }
        if state.config().is_epoch_chain {
            return Ok(())
        }

        let current_head = state.chain().current_block_number();
        let target_height = state.target_height();
        if current_head >= target_height {
            return Ok(())
        }
        let Some(dm) = state.download_manager() else { return Ok(()) };

        for bn in (current_head + 1)..=target_height {
            if state.ctx().is_cancelled() {
                return Err(StageError::Cancelled)
            }
            let Some(details) = dm.download_details(bn) else { break };
            let Some((block_bytes, sig_bytes)) = read_block(state, &details, bn)? else { break };

            let mut block = match Block::decode(&mut block_bytes.as_ref()) {
                Ok(block) => block,
                Err(err) => {
                    warn!(target: "sync::stages::states", bn, %err, "undecodable block bytes");
                    return self.reject_block(state, current_head, bn, expected_hash(state, bn), &details)
                }
            };
            if !sig_bytes.is_empty() {
                block.set_commit_sig(sig_bytes);
            }
            // Peers occasionally mis-number raw blocks; the stored hash is
            // what was actually requested.

            if let Err(err) = state.chain().verify_block(&block) {
                warn!(target: "sync::stages::states", bn, %err, "block verification failed");
                return self.reject_block(state, current_head, bn, block.hash(), &details)
            }
            match state.chain().insert_block(block) {
                Ok(head) => {
                    info!(target: "sync::stages::states", head, "block inserted");
                }
                Err(ChainError::Validation(err)) => {
                    warn!(target: "sync::stages::states", bn, %err, "block rejected on insert");
                    return self.reject_block(state, current_head, bn, expected_hash(state, bn), &details)
                }
                Err(err @ ChainError::Storage(_)) => return Err(StageError::Chain(err)),
            }
        }

        let head = state.chain().current_block_number();
        state.save_stage_progress(StageId::States, head)?;
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

impl StatesStage {
    /// Record the invalid block and revert to the head the cycle started
    /// from. Returns `Ok` so the engine runs the revert pass.
    fn reject_block(
        &self,
        state: &SyncState,
        entry_head: BlockNumber,
        bn: BlockNumber,
        hash: BlockHash,
        details: &DownloadDetails,
    ) -> Result<(), StageError> {
        state.protocol().stream_failed(details.stream_id, "served an invalid block");
        state.mark_invalid_block(bn, hash, Some(details.stream_id));
        state.revert_to(entry_head, hash);
        Ok(())
    }
}

/// The hash the bodies stage requested for this height.
fn expected_hash(state: &SyncState, bn: BlockNumber) -> BlockHash {
    let bucket = Bucket::BlockHashes.for_beacon(state.is_beacon());
    state
        .db()
        .begin_ro()
        .ok()
        .and_then(|view| view.get(bucket, &block_number_key(bn)).ok().flatten())
        .filter(|bytes| bytes.len() == 32)
        .map(|bytes| BlockHash::from_slice(&bytes))
        .unwrap_or_default()
}

/// Read a downloaded block and its signature from the owning worker's
/// scratch database.
fn read_block(
    state: &SyncState,
    details: &DownloadDetails,
    bn: BlockNumber,
) -> Result<Option<(Bytes, Bytes)>, StageError> {
    let Some(block_db) = state.block_dbs().get(details.worker_id) else { return Ok(None) };
    let view = block_db.begin_ro()?;
    let key = block_number_key(bn);
    let Some(block_bytes) = view.get(Bucket::Blocks, &key)? else { return Ok(None) };
    let sig_bytes = view.get(Bucket::BlockSignatures, &key)?.unwrap_or_default();
    Ok(Some((block_bytes, sig_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        encode_block, store_worker_block, test_block, test_state, TestChain, TestProtocol,
    };
    use crate::DownloadManager;
    use std::sync::Arc;
    use strata_primitives::StreamId;

    fn seeded_state(
        head: BlockNumber,
        target: BlockNumber,
        chain: Arc<TestChain>,
    ) -> (crate::SyncState, Vec<Block>) {
        let protocol = Arc::new(TestProtocol::default());
        let state = test_state(chain, protocol);
        state.set_target_height(target);

        let dm = Arc::new(DownloadManager::new(head, target, 10));
        let mut parent = BlockHash::repeat_byte(0xee);
        let mut blocks = Vec::new();
        for bn in (head + 1)..=target {
            let block = test_block(bn, parent);
            parent = block.hash();
            store_worker_block(&state, 0, bn, encode_block(&block), Bytes::from_static(b"sig"));
            dm.handle_request_result(&[bn], 0, StreamId(1));
            blocks.push(block);
        }
        state.set_download_manager(dm);
        (state, blocks)
    }

    #[tokio::test]
    async fn inserts_downloaded_blocks_in_order() {
        let chain = Arc::new(TestChain::new(10));
        let (state, _) = seeded_state(10, 12, chain.clone());

        let stage = state.stage_state(StageId::States).unwrap();
        StatesStage.exec(true, false, &stage, &state).await.unwrap();

        assert_eq!(chain.inserted(), vec![11, 12]);
        assert_eq!(chain.current_block_number(), 12);
        assert_eq!(state.stage_progress(StageId::States).unwrap(), 12);
    }

    #[tokio::test]
    async fn invalid_block_sets_revert_point() {
        let chain = Arc::new(TestChain::new(100));
        let (state, blocks) = seeded_state(100, 110, chain.clone());
        let bad = blocks.iter().find(|block| block.number() == 105).unwrap();
        chain.fail_verification(bad.hash(), 1);

        let stage = state.stage_state(StageId::States).unwrap();
        StatesStage.exec(true, false, &stage, &state).await.unwrap();

        // Blocks below the bad one made it in; the bad one reverts the
        // cycle back to its entry head.
        assert_eq!(chain.inserted(), vec![101, 102, 103, 104]);
        assert_eq!(state.pending_revert_point(), Some(100));
        let invalid = state.invalid_block();
        assert!(invalid.active);
        assert_eq!(invalid.number, 105);
        assert_eq!(invalid.hash, bad.hash());
        assert_eq!(invalid.stream_ids, vec![StreamId(1)]);
    }

    #[tokio::test]
    async fn missing_download_stops_quietly() {
        let chain = Arc::new(TestChain::new(10));
        let protocol = Arc::new(TestProtocol::default());
        let state = test_state(chain.clone(), protocol);
        state.set_target_height(15);
        // No download manager: nothing to insert.
        let stage = state.stage_state(StageId::States).unwrap();
        StatesStage.exec(true, false, &stage, &state).await.unwrap();
        assert!(chain.inserted().is_empty());
    }
}
