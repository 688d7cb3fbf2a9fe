//! Poll cadence for remote runs.

use std::time::Duration;

/// Poll cadence and bounds for waiting on remote state
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Consecutive unrecognized run statuses tolerated before giving up
    pub max_unknown_polls: u32,
    /// Polls of the current state version waiting for its serial to advance
    pub max_state_version_polls: u32,
    /// Attempts to create a run while another run holds the workspace
    pub max_active_run_waits: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
            max_unknown_polls: 10,
            max_state_version_polls: 10,
            max_active_run_waits: 60,
        }
    }
}

impl PollPolicy {
    /// Delay before poll number `iteration` (0-based), growing to `max_interval`
    pub fn delay(&self, iteration: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(iteration.min(64) as i32);
        let millis = self.interval.as_millis() as f64 * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64).max(self.interval.min(self.max_interval))
    }
}
