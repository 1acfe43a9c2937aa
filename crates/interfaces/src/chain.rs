use strata_primitives::{Block, BlockHash, BlockNumber, ShardId};

/// Error variants raised when validating a block against consensus rules.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BlockValidationError {
    /// The block carries no commit signature.
    #[error("missing commit signature for block {number}")]
    MissingCommitSig {
        /// The offending block height.
        number: BlockNumber,
    },
    /// The commit signature does not verify against the committee.
    #[error("invalid commit signature for block {number}")]
    InvalidCommitSig {
        /// The offending block height.
        number: BlockNumber,
    },
    /// The parent of the block is not known to the chain.
    #[error("unknown parent {parent_hash} for block {number}")]
    UnknownParent {
        /// The offending block height.
        number: BlockNumber,
        /// The parent hash the block claims.
        parent_hash: BlockHash,
    },
}

/// Error variants raised by chain store operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    /// The block failed consensus validation.
    #[error(transparent)]
    Validation(#[from] BlockValidationError),
    /// The underlying store failed.
    #[error("chain storage error: {0}")]
    Storage(String),
}

/// The chain store contract used by the sync stages.
///
/// The store is single-writer per shard; only the execution stage writes
/// the canonical chain.
pub trait ChainStore: Send + Sync {
    /// The shard this chain belongs to.
    fn shard_id(&self) -> ShardId;

    /// The current canonical head height.
    fn current_block_number(&self) -> BlockNumber;

    /// Verify a block against consensus rules before insertion.
    fn verify_block(&self, block: &Block) -> Result<(), BlockValidationError>;

    /// Insert a verified block, returning the new canonical height.
    fn insert_block(&self, block: Block) -> Result<BlockNumber, ChainError>;
}
