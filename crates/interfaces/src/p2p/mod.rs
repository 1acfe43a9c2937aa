/// Shared error types for p2p requests.
pub mod error;

/// Request options.
pub mod options;

/// Request priority.
pub mod priority;

/// The sync transport contract.
pub mod protocol;

/// Abstract request/response pairing.
pub mod request;

/// Peer stream traits.
pub mod stream;
