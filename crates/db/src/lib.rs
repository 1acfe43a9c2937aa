#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Transactional ordered-bucket store abstraction used by staged sync.
//!
//! The sync stages talk to storage exclusively through the [`Database`]
//! contract. The crate ships the in-memory backend used for worker scratch
//! databases and tests; disk-backed engines implement the same traits
//! elsewhere.

mod database;
mod error;
pub mod mem;
mod tables;
mod utils;

pub use database::{create_view, Database, DbTx, DbTxMut};
pub use error::{DatabaseError, DbResult};
pub use tables::Bucket;
pub use utils::block_number_key;
