use serde::Deserialize;
use strata_request_manager::RequestManagerConfig;

/// Configuration of the staged sync engine and its stages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker count for the bodies stage; also the number of per-worker
    /// scratch databases.
    pub concurrency: usize,
    /// Batch size handed to each download worker.
    pub blocks_per_request: usize,
    /// Below this many connected streams the sync refuses to start a
    /// cycle.
    pub min_streams: usize,
    /// Keep worker scratch databases in memory.
    pub use_mem_db: bool,
    /// Emit human-readable download progress.
    pub log_progress: bool,
    /// Whether this node follows the epoch chain; body download is skipped
    /// there.
    pub is_epoch_chain: bool,
    /// Request manager tunables.
    pub request_manager: RequestManagerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 4,
            blocks_per_request: 10,
            min_streams: 3,
            use_mem_db: true,
            log_progress: false,
            is_epoch_chain: false,
            request_manager: RequestManagerConfig::default(),
        }
    }
}
