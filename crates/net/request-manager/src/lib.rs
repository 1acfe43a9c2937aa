#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Stream request manager.
//!
//! Maps abstract requests onto a dynamic pool of bidirectional peer
//! streams, one in-flight request per stream, and matches inbound
//! deliveries back to the issuing callers.
//!
//! All state is owned by a single event-loop task; the [`RequestManager`]
//! handle talks to it over bounded channels and is safe to share across
//! tasks.

mod config;
mod manager;
mod queues;
mod stream;

pub use config::RequestManagerConfig;
pub use manager::{RequestManager, RequestOutcome};
