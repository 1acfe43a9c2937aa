use crate::{
    download::DownloadManager,
    error::StageError,
    id::StageId,
    stage::StageHandler,
    stages::REQUEST_TIMEOUT,
    state::{CleanUpState, RevertState, StageState, SyncState},
};
use async_trait::async_trait;
use std::sync::Arc;
use strata_db::{block_number_key, create_view, Bucket, Database, DatabaseError, DbTx, DbTxMut};
use strata_interfaces::p2p::{
    error::RequestError,
    options::RequestOptions,
    protocol::{ProtocolError, SyncProtocol},
};
use strata_primitives::{BlockHash, BlockNumber, Bytes};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A batch of block numbers and their expected hashes, consumed by one
/// worker.
#[derive(Debug)]
struct BlockTask {
    bns: Vec<BlockNumber>,
    hashes: Vec<BlockHash>,
}

/// Downloads block bodies into per-worker scratch databases.
///
/// A producer partitions `(progress, target]` into batches through the
/// download manager and looks up the expected hashes from the hash index;
/// `concurrency` workers fetch the raw blocks by hash and write them, with
/// their commit signatures, into their own scratch database. Failed batches
/// go back to the download manager for another worker.
#[derive(Debug, Default)]
pub struct BodiesStage;

#[async_trait]
impl StageHandler for BodiesStage {
    fn id(&self) -> StageId {
        StageId::Bodies
    }

    async fn exec(
        &self,
        _first_cycle: bool,
        invalid_block_revert: bool,
        stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        // Long-range sync only; the epoch chain has no bodies to pull.
        if !state.init_sync() {
            return Ok(())
        }
        if state.config().is_epoch_chain {
            return Ok(())
        }
        if invalid_block_revert {
            return redownload_bad_block(state).await
        }

        let current_head = state.chain().current_block_number();
        let target_height = state.target_height();
        if current_head >= target_height {
            return Ok(())
        }

        let mut curr_progress = stage.block_number;
        if curr_progress <= current_head {
            // Fresh cycle; stale scratch data would shadow new downloads.
            clean_all_block_dbs(state)?;
            curr_progress = current_head;
        }
        if curr_progress >= target_height {
            return Ok(())
        }

        let dm = Arc::new(DownloadManager::new(
            curr_progress,
            target_height,
            state.config().blocks_per_request,
        ));
        state.set_download_manager(dm.clone());

        run_download_loop(state, &dm).await?;

        state.save_stage_progress(StageId::Bodies, target_height)?;
        Ok(())
    }

    async fn revert(
        &self,
        _first_cycle: bool,
        revert: &RevertState,
        _stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        clean_all_block_dbs(state)?;
        let current_head = state.chain().current_block_number();
        state.save_stage_progress(StageId::Bodies, current_head)?;
        revert.done(state)
    }

    async fn clean_up(
        &self,
        _first_cycle: bool,
        _cleanup: &CleanUpState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        clean_all_block_dbs(state)
    }
}

/// Producer/worker pool over the download manager's batches.
async fn run_download_loop(state: &SyncState, dm: &Arc<DownloadManager>) -> Result<(), StageError> {
    let concurrency = state.config().concurrency.max(1);
    let (batch_tx, batch_rx) = mpsc::channel::<BlockTask>(concurrency);
    let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
    let fatal: Arc<parking_lot::Mutex<Option<StageError>>> = Arc::default();

    let mut workers = JoinSet::new();
    for worker_id in 0..concurrency {
        let batch_rx = batch_rx.clone();
        let dm = dm.clone();
        let protocol = state.protocol().clone();
        let block_db = state.block_dbs()[worker_id].clone();
        let ctx = state.ctx().clone();
        let fatal = fatal.clone();
        workers.spawn(async move {
            loop {
                let task = { batch_rx.lock().await.recv().await };
                let Some(task) = task else { break };
                if let Err(err) =
                    run_block_worker(protocol.as_ref(), &dm, block_db.as_ref(), task, worker_id, &ctx)
                        .await
                {
                    if matches!(err, StageError::SaveBlocksFailed(_)) {
                        let mut slot = fatal.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        break
                    }
                    // Transient failures were re-enqueued for another
                    // worker.
                }
            }
        });
    }

    let started = std::time::Instant::now();
    let mut result = Ok(());
    loop {
        if state.ctx().is_cancelled() {
            result = Err(StageError::Cancelled);
            break
        }
        if fatal.lock().is_some() {
            break
        }
        let batch = dm.get_next_batch();
        if batch.is_empty() {
            if dm.is_finished() {
                break
            }
            // In-flight batches may still fail and come back as retries.
            tokio::select! {
                _ = state.ctx().cancelled() => {
                    result = Err(StageError::Cancelled);
                    break
                }
                _ = dm.wait_progress() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
            continue
        }
        let hashes = match fetch_block_hashes(state, &batch) {
            Ok(hashes) => hashes,
            Err(err) => {
                error!(target: "sync::stages::bodies", bns = ?batch, %err, "fetching block hashes failed");
                result = Err(err);
                break
            }
        };
        if hashes.len() != batch.len() {
            result = Err(StageError::ReadHashesFailed("hash count mismatch".into()));
            break
        }
        if batch_tx.send(BlockTask { bns: batch, hashes }).await.is_err() {
            break
        }
        if state.config().log_progress {
            let downloaded = dm.downloaded_count();
            let speed = downloaded as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                target: "sync::stages::bodies",
                downloaded,
                target_height = dm.target(),
                "downloading blocks ({speed:.2} blocks/s)"
            );
        }
    }

    drop(batch_tx);
    while workers.join_next().await.is_some() {}

    if let Some(err) = fatal.lock().take() {
        return Err(err)
    }
    result
}

/// Download and store a single batch.
async fn run_block_worker(
    protocol: &dyn SyncProtocol,
    dm: &DownloadManager,
    block_db: &dyn Database,
    task: BlockTask,
    worker_id: usize,
    ctx: &CancellationToken,
) -> Result<(), StageError> {
    let BlockTask { bns, hashes } = task;
    if hashes.is_empty() {
        return Ok(())
    }

    let outcome = tokio::select! {
        _ = ctx.cancelled() => Err(ProtocolError::from(RequestError::Cancelled)),
        res = tokio::time::timeout(
            REQUEST_TIMEOUT,
            protocol.get_raw_blocks_by_hashes(hashes, RequestOptions::new()),
        ) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(RequestError::Timeout.into()),
        },
    };

    let (block_bytes, sig_bytes, stream_id) = match outcome {
        Ok(delivered) => delivered,
        Err(err) => {
            if !err.is_cancellation() {
                if let Some(stream_id) = err.stream_id {
                    protocol.stream_failed(stream_id, "download raw blocks failed");
                }
            }
            warn!(target: "sync::stages::bodies", bns = ?bns, %err, "download raw blocks failed");
            dm.handle_request_error(&bns, &err, err.stream_id);
            return Err(StageError::Request(err.kind))
        }
    };

    if block_bytes.is_empty() {
        // Remote peer is not fully synced.
        let err = ProtocolError::on_stream(RequestError::EmptyResponse, stream_id);
        dm.handle_request_error(&bns, &err, Some(stream_id));
        protocol.remove_stream(stream_id);
        return Err(StageError::Request(err.kind))
    }
    if block_bytes.len() != bns.len() {
        let err = ProtocolError::on_stream(
            RequestError::BadResponse("delivered block count does not match request".into()),
            stream_id,
        );
        dm.handle_request_error(&bns, &err, Some(stream_id));
        protocol.remove_stream(stream_id);
        return Err(StageError::Request(err.kind))
    }
    if block_bytes.iter().any(|bytes| bytes.len() <= 1) {
        let err = ProtocolError::on_stream(
            RequestError::BadResponse("invalid block bytes".into()),
            stream_id,
        );
        dm.handle_request_error(&bns, &err, Some(stream_id));
        protocol.remove_stream(stream_id);
        return Err(StageError::Request(err.kind))
    }

    save_blocks(block_db, &bns, &block_bytes, &sig_bytes)?;
    dm.handle_request_result(&bns, worker_id, stream_id);
    Ok(())
}

/// Re-download the recorded invalid block, avoiding the streams that served
/// it before.
async fn redownload_bad_block(state: &SyncState) -> Result<(), StageError> {
    let invalid = state.invalid_block();
    if invalid.hash == BlockHash::ZERO {
        return Ok(())
    }
    let bns = vec![invalid.number];

    loop {
        if state.ctx().is_cancelled() {
            return Err(StageError::Cancelled)
        }
        if state.protocol().num_streams() == 0 {
            error!(
                target: "sync::stages::bodies",
                bad_block = invalid.number,
                "not enough streams to re-download bad block"
            );
            return Err(StageError::Request(RequestError::NotEnoughStreams { actual: 0, min: 1 }))
        }

        let outcome = tokio::select! {
            _ = state.ctx().cancelled() => return Err(StageError::Cancelled),
            res = tokio::time::timeout(
                REQUEST_TIMEOUT,
                state.protocol().get_raw_blocks_by_number(bns.clone(), RequestOptions::new()),
            ) => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(ProtocolError::from(RequestError::Timeout)),
            },
        };

        let (block_bytes, sig_bytes, stream_id) = match outcome {
            Ok(delivered) => delivered,
            Err(err) => {
                if err.kind == RequestError::Cancelled {
                    return Err(StageError::Cancelled)
                }
                if !err.is_cancellation() {
                    if let Some(stream_id) = err.stream_id {
                        state.protocol().stream_failed(stream_id, "re-download bad block failed");
                    }
                }
                continue
            }
        };

        if invalid.stream_ids.contains(&stream_id) {
            state
                .protocol()
                .stream_failed(stream_id, "re-download bad block from this stream failed");
            continue
        }

        if let Some(dm) = state.download_manager() {
            dm.set_download_details(&bns, 0, stream_id);
        }
        if let Err(err) = save_blocks(state.block_dbs()[0].as_ref(), &bns, &block_bytes, &sig_bytes)
        {
            error!(
                target: "sync::stages::bodies",
                bad_block = invalid.number,
                %err,
                "saving re-downloaded bad block failed"
            );
            continue
        }
        return Ok(())
    }
}

/// Look up the expected hashes for a batch from the hash index.
fn fetch_block_hashes(
    state: &SyncState,
    bns: &[BlockNumber],
) -> Result<Vec<BlockHash>, StageError> {
    let bucket = Bucket::BlockHashes.for_beacon(state.is_beacon());
    create_view(state.db().as_ref(), None, |tx| {
        let mut hashes = Vec::with_capacity(bns.len());
        for bn in bns {
            match tx.get(bucket, &block_number_key(*bn))? {
                Some(bytes) if bytes.len() == 32 => hashes.push(BlockHash::from_slice(&bytes)),
                _ => return Err(DatabaseError::Read(format!("missing hash for block {bn}"))),
            }
        }
        Ok(hashes)
    })
    .map_err(|err| StageError::ReadHashesFailed(err.to_string()))
}

/// Write a delivered batch and its signatures in one transaction.
fn save_blocks(
    block_db: &dyn Database,
    bns: &[BlockNumber],
    block_bytes: &[Bytes],
    sig_bytes: &[Bytes],
) -> Result<(), StageError> {
    let mut tx = block_db.begin_rw().map_err(StageError::SaveBlocksFailed)?;
    for (i, bn) in bns.iter().enumerate() {
        let block = &block_bytes[i];
        if block.is_empty() {
            continue
        }
        let key = block_number_key(*bn);
        tx.put(Bucket::Blocks, &key, block.clone()).map_err(StageError::SaveBlocksFailed)?;
        let sig = sig_bytes.get(i).cloned().unwrap_or_default();
        tx.put(Bucket::BlockSignatures, &key, sig).map_err(StageError::SaveBlocksFailed)?;
    }
    tx.commit().map_err(StageError::SaveBlocksFailed)
}

/// Clear every worker scratch database.
fn clean_all_block_dbs(state: &SyncState) -> Result<(), StageError> {
    for block_db in state.block_dbs() {
        let mut tx = block_db.begin_rw()?;
        tx.clear_bucket(Bucket::Blocks)?;
        tx.clear_bucket(Bucket::BlockSignatures)?;
        tx.commit()?;
    }
    Ok(())
}
