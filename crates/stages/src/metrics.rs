//! Sync metrics.

use crate::id::StageId;
use metrics::{counter, gauge};

/// Record the last committed progress of a stage.
pub(crate) fn record_checkpoint(stage: StageId, progress: u64) {
    gauge!("sync_checkpoint", progress as f64, "stage" => stage.as_str());
}

/// Count a started sync cycle.
pub(crate) fn record_cycle() {
    counter!("sync_cycles_total", 1);
}
