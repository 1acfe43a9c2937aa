use crate::p2p::{error::RequestError, options::RequestOptions};
use async_trait::async_trait;
use std::fmt;
use strata_primitives::{Block, BlockHash, BlockNumber, Bytes, StreamId};

/// Result alias for protocol calls.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A request failure tagged with the stream that was serving the request,
/// when one had been assigned.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{kind}")]
pub struct ProtocolError {
    /// The underlying request failure.
    pub kind: RequestError,
    /// The stream the request was assigned to, if any.
    pub stream_id: Option<StreamId>,
}

impl ProtocolError {
    /// A failure observed on the given stream.
    pub fn on_stream(kind: RequestError, stream_id: StreamId) -> Self {
        Self { kind, stream_id: Some(stream_id) }
    }

    /// Whether the failure came from the caller giving up rather than from
    /// the peer misbehaving.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind, RequestError::Cancelled | RequestError::Timeout)
    }
}

impl From<RequestError> for ProtocolError {
    fn from(kind: RequestError) -> Self {
        Self { kind, stream_id: None }
    }
}

/// The transport contract used by the sync stages for block-related
/// queries.
///
/// Each query returns the id of the stream that served it so callers can
/// penalize misbehaving peers. Implementations schedule the queries through
/// the stream request manager; the core depends only on this contract.
#[async_trait]
pub trait SyncProtocol: Send + Sync + fmt::Debug {
    /// Probe a remote peer for its current head height.
    async fn get_current_block_number(
        &self,
        opts: RequestOptions,
    ) -> ProtocolResult<(BlockNumber, StreamId)>;

    /// Fetch decoded blocks by number. Entries the peer does not have are
    /// `None`.
    async fn get_blocks_by_number(
        &self,
        bns: Vec<BlockNumber>,
        opts: RequestOptions,
    ) -> ProtocolResult<(Vec<Option<Block>>, StreamId)>;

    /// Fetch RLP-encoded blocks and their commit signatures by number.
    async fn get_raw_blocks_by_number(
        &self,
        bns: Vec<BlockNumber>,
        opts: RequestOptions,
    ) -> ProtocolResult<(Vec<Bytes>, Vec<Bytes>, StreamId)>;

    /// Fetch RLP-encoded blocks and their commit signatures by hash.
    async fn get_raw_blocks_by_hashes(
        &self,
        hashes: Vec<BlockHash>,
        opts: RequestOptions,
    ) -> ProtocolResult<(Vec<Bytes>, Vec<Bytes>, StreamId)>;

    /// The number of streams currently connected.
    fn num_streams(&self) -> usize;

    /// Report a stream that served a bad or failed response. The transport
    /// decides whether to cool down or disconnect the peer.
    fn stream_failed(&self, stream_id: StreamId, reason: &str);

    /// Remove a stream from the pool.
    fn remove_stream(&self, stream_id: StreamId);
}
