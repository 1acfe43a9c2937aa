use crate::id::StageId;
use strata_db::DatabaseError;
use strata_interfaces::{chain::ChainError, p2p::error::RequestError};
use thiserror::Error;

/// A stage execution error.
///
/// Transient transport errors never reach this type; they are confined to
/// the worker and request-manager loops. What surfaces here aborts the
/// cycle.
#[derive(Debug, Error)]
pub enum StageError {
    /// Reading block hashes from the hash index failed. The index must be
    /// built before bodies are downloaded.
    #[error("read block hashes from db failed: {0}")]
    ReadHashesFailed(String),
    /// Writing downloaded blocks to a worker database failed.
    #[error("save blocks to db failed: {0}")]
    SaveBlocksFailed(DatabaseError),
    /// Persisting stage progress failed.
    #[error("save progress failed: {0}")]
    SaveProgressFailed(DatabaseError),
    /// The stage was cancelled.
    #[error("stage cancelled")]
    Cancelled,
    /// The stage encountered a database error.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// The chain store failed.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// A request-layer failure that the stage could not recover from.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// A sync cycle error.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A stage id was not found in the forward order.
    #[error("stage {0} not found")]
    StageNotFound(StageId),
    /// A stage handler failed, aborting the cycle.
    #[error(transparent)]
    Stage(#[from] StageError),
    /// The cycle preflight failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}
