/// Result alias for store operations.
pub type DbResult<T> = Result<T, DatabaseError>;

/// Error variants raised by a store backend.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DatabaseError {
    /// Opening a transaction failed.
    #[error("failed to open transaction: {0}")]
    InitTx(String),
    /// A read failed.
    #[error("read failed: {0}")]
    Read(String),
    /// A write failed.
    #[error("write failed: {0}")]
    Write(String),
    /// Committing a transaction failed.
    #[error("commit failed: {0}")]
    Commit(String),
}
