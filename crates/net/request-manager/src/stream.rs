use std::sync::Arc;
use strata_interfaces::p2p::{request::RequestId, stream::SyncStream};

/// A known live stream and the request currently assigned to it.
///
/// The `request ↔ stream` link is kept as ids resolved through the central
/// maps; neither side owns the other.
pub(crate) struct StreamEntry {
    pub(crate) inner: Arc<dyn SyncStream>,
    /// The in-flight request on this stream, at most one.
    pub(crate) req: Option<RequestId>,
}

impl StreamEntry {
    pub(crate) fn new(inner: Arc<dyn SyncStream>) -> Self {
        Self { inner, req: None }
    }
}
