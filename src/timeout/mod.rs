//! Timeout configuration and heartbeat assessment.
//!
//! This module holds every time budget the conductor enforces: the per-goal
//! wall-clock limit, heartbeat cadence and stall threshold, lock waits and
//! individual git commands.

pub mod heartbeat;

use std::time::Duration;

pub use heartbeat::{Heartbeat, HeartbeatEvent, HeartbeatMonitor};

/// Configuration for timeout behavior during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Wall-clock budget for one goal, from snapshot creation to commit.
    /// Default: 1800 seconds (30 minutes)
    pub goal_timeout: Duration,

    /// Expected interval between heartbeat pulses from a worker.
    /// Default: 10 seconds
    pub heartbeat_interval: Duration,

    /// Number of missed heartbeats before a worker is considered stalled.
    /// Default: 12
    pub missed_heartbeats_threshold: u32,

    /// Time after spawn before heartbeat checks begin, covering worktree
    /// creation and agent start-up.
    /// Default: 30 seconds
    pub startup_grace_period: Duration,

    /// Maximum time to wait for a single file lock acquisition.
    /// Default: 30 seconds
    pub lock_timeout: Duration,

    /// Maximum time allowed for an individual git command.
    /// Default: 60 seconds
    pub git_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            goal_timeout: Duration::from_secs(1800),
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats_threshold: 12,
            startup_grace_period: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30),
            git_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Silence after which a worker is force-cancelled:
    /// `heartbeat_interval * missed_heartbeats_threshold`.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.missed_heartbeats_threshold)
    }

    pub fn with_goal_timeout(mut self, timeout: Duration) -> Self {
        self.goal_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_missed_heartbeats_threshold(mut self, threshold: u32) -> Self {
        self.missed_heartbeats_threshold = threshold;
        self
    }

    /// Sets the startup grace period before heartbeat checks apply.
    pub fn with_startup_grace_period(mut self, grace_period: Duration) -> Self {
        self.startup_grace_period = grace_period;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the git operation timeout.
    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }
}
