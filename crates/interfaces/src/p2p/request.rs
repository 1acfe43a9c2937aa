use crate::p2p::error::RequestResult;
use std::{any::Any, fmt};
use strata_primitives::{Bytes, ShardId};

/// Identifier pairing a request with its response on a stream.
///
/// Unique only over the currently pending requests.
pub type RequestId = u64;

/// The protocol specification negotiated with the remote peer when the
/// stream was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtoSpec {
    /// The shard the stream is serving.
    pub shard_id: ShardId,
    /// Negotiated protocol version.
    pub version: u32,
}

/// An abstract request the request manager can schedule onto a stream.
pub trait Request: Send + Sync + fmt::Debug {
    /// Encode the request for the wire, stamped with the assigned request id.
    fn encode_with_id(&self, req_id: RequestId) -> RequestResult<Bytes>;

    /// Whether a stream negotiated with `spec` can serve this request.
    fn is_supported_by(&self, spec: &ProtoSpec) -> bool;
}

/// An inbound response frame decoded by the transport.
pub trait Response: Send + fmt::Debug + 'static {
    /// The request id echoed by the remote peer.
    fn req_id(&self) -> RequestId;

    /// Downcast support for protocol implementations.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}
