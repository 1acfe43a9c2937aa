use crate::p2p::{error::RequestResult, request::ProtoSpec};
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use strata_primitives::{Bytes, StreamId};
use tokio::sync::broadcast;

/// A persistent bidirectional peer connection capable of carrying
/// request/response pairs.
#[async_trait]
pub trait SyncStream: Send + Sync + fmt::Debug {
    /// The unique id of the stream.
    fn id(&self) -> StreamId;

    /// The protocol spec negotiated with the remote peer.
    fn proto_spec(&self) -> ProtoSpec;

    /// Write a request frame to the remote peer.
    async fn write_bytes(&self, bytes: Bytes) -> RequestResult<()>;
}

/// Event emitted by the transport's stream pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A stream finished its handshake and joined the pool.
    Added(StreamId),
    /// A stream was closed or evicted from the pool.
    Removed(StreamId),
}

/// Read access to the live stream pool plus event subscription.
///
/// Events are advisory wake-ups; consumers reconcile against the
/// [`streams`](StreamManager::streams) snapshot to catch missed events.
pub trait StreamManager: Send + Sync {
    /// Snapshot of the currently connected streams.
    fn streams(&self) -> Vec<Arc<dyn SyncStream>>;

    /// Subscribe to pool membership changes.
    fn subscribe(&self) -> broadcast::Receiver<StreamEvent>;
}
