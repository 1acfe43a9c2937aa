//! Stage progress bookkeeping.
//!
//! Forward and cleanup progress live in the `StageProgress` and
//! `StageCleanUpProgress` buckets, keyed by stage name with a beacon
//! prefix when the engine serves the beacon shard.

use crate::id::StageId;
use strata_db::{Bucket, DatabaseError, DbResult, DbTx, DbTxMut};
use strata_primitives::{BlockNumber, Bytes};

fn stage_key(id: StageId, is_beacon: bool) -> Vec<u8> {
    let mut key = Vec::new();
    if is_beacon {
        key.extend_from_slice(b"beacon:");
    }
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

fn decode_progress(value: Option<Bytes>) -> DbResult<BlockNumber> {
    match value {
        None => Ok(0),
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| DatabaseError::Read("malformed progress value".into()))?;
            Ok(BlockNumber::from_be_bytes(raw))
        }
    }
}

/// Read the forward progress of a stage; missing entries read as 0.
pub(crate) fn get_stage_progress(
    tx: &dyn DbTx,
    id: StageId,
    is_beacon: bool,
) -> DbResult<BlockNumber> {
    decode_progress(tx.get(Bucket::StageProgress, &stage_key(id, is_beacon))?)
}

/// Persist the forward progress of a stage.
pub(crate) fn save_stage_progress(
    tx: &mut dyn DbTxMut,
    id: StageId,
    is_beacon: bool,
    progress: BlockNumber,
) -> DbResult<()> {
    tx.put(
        Bucket::StageProgress,
        &stage_key(id, is_beacon),
        Bytes::copy_from_slice(&progress.to_be_bytes()),
    )
}

/// Read the cleanup progress of a stage; missing entries read as 0.
pub(crate) fn get_cleanup_progress(
    tx: &dyn DbTx,
    id: StageId,
    is_beacon: bool,
) -> DbResult<BlockNumber> {
    decode_progress(tx.get(Bucket::StageCleanUpProgress, &stage_key(id, is_beacon))?)
}

/// Persist the cleanup progress of a stage.
pub(crate) fn save_cleanup_progress(
    tx: &mut dyn DbTxMut,
    id: StageId,
    is_beacon: bool,
    progress: BlockNumber,
) -> DbResult<()> {
    tx.put(
        Bucket::StageCleanUpProgress,
        &stage_key(id, is_beacon),
        Bytes::copy_from_slice(&progress.to_be_bytes()),
    )
}
