use tokio::sync::{mpsc, oneshot};

/// Result alias for result of a request.
pub type RequestResult<T> = Result<T, RequestError>;

/// Error variants that can happen when issuing requests over peer streams.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Closed channel to the request manager.
    #[error("closed channel to the request manager")]
    ChannelClosed,
    /// The request manager was shut down. Terminal; the subsystem must be
    /// recreated to retry.
    #[error("request manager is closed")]
    Closed,
    /// Request timed out while awaiting response.
    #[error("request timed out while awaiting response")]
    Timeout,
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The serving stream was removed while the request was in flight.
    #[error("stream removed when doing request")]
    StreamRemoved,
    /// The waiting queue is at capacity.
    #[error("waiting queue is full")]
    QueueFull,
    /// The peer answered with an empty response.
    #[error("received empty response")]
    EmptyResponse,
    /// The peer answered with a malformed or unexpected response.
    #[error("received bad response: {0}")]
    BadResponse(String),
    /// Writing the encoded request to the stream failed.
    #[error("failed to write request to stream: {0}")]
    WriteFailed(String),
    /// Fewer streams connected than the configured minimum.
    #[error("number of streams smaller than minimum: {actual} < {min}")]
    NotEnoughStreams {
        /// Streams currently connected.
        actual: usize,
        /// Configured minimum.
        min: usize,
    },
}

impl<T> From<mpsc::error::SendError<T>> for RequestError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        RequestError::ChannelClosed
    }
}

impl From<oneshot::error::RecvError> for RequestError {
    fn from(_: oneshot::error::RecvError) -> Self {
        RequestError::ChannelClosed
    }
}
