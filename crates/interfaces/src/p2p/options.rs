use crate::p2p::priority::Priority;
use strata_primitives::StreamId;

/// Options for a single request issued through the request manager.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    priority: Priority,
    whitelist: Option<Vec<StreamId>>,
}

impl RequestOptions {
    /// Default options: normal priority, any stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the request ahead of normal-priority requests.
    pub fn with_high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self
    }

    /// Restrict the request to the given streams.
    pub fn with_whitelist(mut self, ids: impl IntoIterator<Item = StreamId>) -> Self {
        self.whitelist = Some(ids.into_iter().collect());
        self
    }

    /// The scheduling priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The allowed streams, if the request is restricted.
    pub fn whitelist(&self) -> Option<&[StreamId]> {
        self.whitelist.as_deref()
    }

    /// Whether the given stream may serve this request.
    pub fn is_stream_allowed(&self, id: StreamId) -> bool {
        self.whitelist.as_ref().map_or(true, |ids| ids.contains(&id))
    }
}
