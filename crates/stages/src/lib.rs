#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Staged long-range block synchronization.
//!
//! The engine drives a totally ordered list of stages through sync cycles.
//! Each stage has forward, revert, and cleanup behaviors; per-stage
//! progress is persisted in named buckets so cycles resume where they left
//! off. The heavy lifting lives in the stages themselves; the canonical one
//! is [`stages::BodiesStage`], which downloads block bodies through a
//! worker pool backed by the stream request manager.

mod config;
mod download;
mod error;
mod id;
mod metrics;
mod progress;
mod stage;
mod state;
mod sync;
mod timing;

pub mod stages;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use download::{DownloadDetails, DownloadManager};
pub use error::{StageError, SyncError};
pub use id::{StageId, DEFAULT_CLEANUP_ORDER, DEFAULT_REVERT_ORDER, DEFAULT_STAGE_ORDER};
pub use stage::{Stage, StageHandler};
pub use state::{CleanUpState, InvalidBlock, RevertState, StageState, SyncCycle, SyncState};
pub use sync::StagedSync;
pub use timing::{Timing, TimingKind};
