//! Per-channel byte-rate measurement and work-split arbitration.

use crate::{config::PerformanceConfig, events::EventBus};
use rbit_interfaces::{events::Chase, p2p::ChannelId};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Verdict on a channel's reported window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep going.
    Normal,
    /// Rate stayed below the floor for the configured window count.
    Slow,
    /// Zero progress with outstanding work for the configured window count.
    Stalled,
}

#[derive(Debug, Default)]
struct ChannelStats {
    rate: u64,
    outstanding: usize,
    slow_windows: usize,
    zero_windows: usize,
    starved: bool,
}

/// Measures per-channel byte rate, flags slow and stalled channels for stop,
/// and volunteers the busiest channel for a split when peers go idle.
///
/// The thresholds are configuration; this implements only the mechanism.
#[derive(Debug)]
pub struct PerformanceGovernor {
    config: PerformanceConfig,
    events: EventBus,
    channels: HashMap<ChannelId, ChannelStats>,
}

impl PerformanceGovernor {
    /// Creates the governor.
    pub fn new(config: PerformanceConfig, events: EventBus) -> Self {
        Self { config, events, channels: HashMap::new() }
    }

    /// Drops a channel's stats on disconnect.
    pub fn deregister(&mut self, channel: ChannelId) {
        self.channels.remove(&channel);
    }

    /// Records the outstanding work a channel holds.
    pub fn set_outstanding(&mut self, channel: ChannelId, outstanding: usize) {
        let stats = self.channels.entry(channel).or_default();
        stats.outstanding = outstanding;
        if outstanding > 0 {
            stats.starved = false;
        }
    }

    /// Handles one window report from a channel, returning its verdict.
    pub fn report(
        &mut self,
        channel: ChannelId,
        bytes_per_second: u64,
        outstanding: usize,
    ) -> Verdict {
        if !self.config.enabled {
            return Verdict::Normal
        }

        let stats = self.channels.entry(channel).or_default();
        stats.rate = bytes_per_second;
        stats.outstanding = outstanding;

        if outstanding == 0 {
            // An idle channel is neither slow nor stalled.
            stats.slow_windows = 0;
            stats.zero_windows = 0;
            return Verdict::Normal
        }

        if bytes_per_second == 0 {
            stats.zero_windows += 1;
        } else {
            stats.zero_windows = 0;
        }
        if bytes_per_second < self.config.slow_bytes_per_second {
            stats.slow_windows += 1;
        } else {
            stats.slow_windows = 0;
        }
        trace!(
            target: "chasers::governor",
            channel, bytes_per_second, outstanding, "rate report"
        );
        metrics::gauge!("chasers.channel_rate", bytes_per_second as f64);

        if stats.zero_windows >= self.config.stall_windows {
            debug!(target: "chasers::governor", channel, "stalled channel");
            return Verdict::Stalled
        }
        if stats.slow_windows >= self.config.slow_windows {
            debug!(target: "chasers::governor", channel, "slow channel");
            return Verdict::Slow
        }
        Verdict::Normal
    }

    /// Notes a channel idle with no work available and, when enough peers
    /// are connected, asks the busiest channel to donate half its map.
    pub fn starved(&mut self, channel: ChannelId) {
        self.channels.entry(channel).or_default().starved = true;

        if self.channels.len() < self.config.minimum_for_stall_divide {
            return
        }
        let donor = self
            .channels
            .iter()
            .filter(|(id, stats)| **id != channel && stats.outstanding > 1)
            .max_by_key(|(_, stats)| stats.outstanding)
            .map(|(id, _)| *id);
        if let Some(donor) = donor {
            debug!(target: "chasers::governor", donor, starved = channel, "splitting work");
            self.events.publish(Chase::Split { channel: donor });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PerformanceConfig {
        PerformanceConfig {
            enabled: true,
            interval_seconds: 1,
            slow_bytes_per_second: 100,
            slow_windows: 2,
            stall_windows: 2,
            minimum_for_stall_divide: 2,
        }
    }

    #[test]
    fn sustained_low_rate_is_slow() {
        let mut governor = PerformanceGovernor::new(config(), EventBus::new(8));
        assert_eq!(governor.report(1, 50, 10), Verdict::Normal);
        assert_eq!(governor.report(1, 50, 10), Verdict::Slow);
    }

    #[test]
    fn recovery_resets_the_windows() {
        let mut governor = PerformanceGovernor::new(config(), EventBus::new(8));
        assert_eq!(governor.report(1, 50, 10), Verdict::Normal);
        assert_eq!(governor.report(1, 500, 10), Verdict::Normal);
        assert_eq!(governor.report(1, 50, 10), Verdict::Normal);
    }

    #[test]
    fn zero_progress_with_work_stalls() {
        let mut governor = PerformanceGovernor::new(config(), EventBus::new(8));
        assert_eq!(governor.report(1, 0, 10), Verdict::Normal);
        assert_eq!(governor.report(1, 0, 10), Verdict::Stalled);
    }

    #[test]
    fn idle_channel_is_never_flagged() {
        let mut governor = PerformanceGovernor::new(config(), EventBus::new(8));
        assert_eq!(governor.report(1, 0, 0), Verdict::Normal);
        assert_eq!(governor.report(1, 0, 0), Verdict::Normal);
        assert_eq!(governor.report(1, 0, 0), Verdict::Normal);
    }

    #[test]
    fn starvation_asks_the_busiest_peer_to_split() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let mut governor = PerformanceGovernor::new(config(), events);
        governor.set_outstanding(1, 1000);
        governor.set_outstanding(2, 10);

        governor.starved(3);
        assert_eq!(rx.try_recv().unwrap(), Chase::Split { channel: 1 });
    }

    #[test]
    fn no_split_below_peer_minimum() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let mut governor = PerformanceGovernor::new(
            PerformanceConfig { minimum_for_stall_divide: 3, ..config() },
            events,
        );
        governor.set_outstanding(1, 1000);

        governor.starved(2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn no_split_without_a_divisible_donor() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let mut governor = PerformanceGovernor::new(config(), events);
        governor.set_outstanding(1, 1);

        governor.starved(2);
        assert!(rx.try_recv().is_err());
    }
}
