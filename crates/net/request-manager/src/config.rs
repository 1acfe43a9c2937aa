use serde::Deserialize;
use std::time::Duration;

/// Tunables of the request manager event loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestManagerConfig {
    /// How often waiting requests are matched against available streams.
    pub throttle_interval: Duration,
    /// Maximum number of assignments per throttle pulse.
    pub throttle_batch: usize,
    /// How long an inbound delivery may wait for buffer space before it is
    /// dropped.
    pub deliver_timeout: Duration,
    /// Capacity of each waiting queue; pushes beyond it fail with
    /// `QueueFull`.
    pub waiting_capacity: usize,
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(100),
            throttle_batch: 16,
            deliver_timeout: Duration::from_secs(10),
            waiting_capacity: 1024,
        }
    }
}
