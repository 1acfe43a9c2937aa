#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Commonly used types for the strata sync stack.

mod block;
mod stream;

pub use block::{Block, Header};
pub use stream::StreamId;

pub use alloy_primitives::{keccak256, Bytes, B256};

/// A block number.
pub type BlockNumber = u64;

/// A block hash.
pub type BlockHash = B256;

/// The identifier of a shard.
pub type ShardId = u32;
