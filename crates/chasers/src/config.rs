//! Node core configuration.

use serde::{Deserialize, Serialize};

/// Configuration of the acquisition pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Maximum heights per download map handed to a channel.
    pub maximum_inventory: usize,
    /// Unconnecting announcements tolerated per channel before disconnect.
    pub maximum_advertisement: usize,
    /// Event bus queue depth.
    pub event_capacity: usize,
    /// Channel performance policy.
    pub performance: PerformanceConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            maximum_inventory: rbit_interfaces::p2p::MAX_INVENTORY,
            maximum_advertisement: 10,
            event_capacity: 1024,
            performance: PerformanceConfig::default(),
        }
    }
}

/// Byte-rate policy for block download channels.
///
/// Thresholds are configuration; the governor implements only the mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Enables rate reporting and verdicts.
    pub enabled: bool,
    /// Seconds per measurement window.
    pub interval_seconds: u64,
    /// Rate floor in bytes per second.
    pub slow_bytes_per_second: u64,
    /// Consecutive below-floor windows before `slow_channel`.
    pub slow_windows: usize,
    /// Consecutive zero-rate windows with outstanding work before
    /// `stalled_channel`.
    pub stall_windows: usize,
    /// Minimum connected download channels before work splitting is
    /// attempted.
    pub minimum_for_stall_divide: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 10,
            slow_bytes_per_second: 1024,
            slow_windows: 3,
            stall_windows: 2,
            minimum_for_stall_divide: 2,
        }
    }
}
