//! Worker heartbeats and stall detection.
//!
//! Each worker owns a [`Heartbeat`] that its agent loop pulses at checkpoints
//! and on output. The coordinator polls every live worker through a
//! [`HeartbeatMonitor`], which turns the silence since the last pulse into
//! warnings and, past the threshold, a stall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::TimeoutConfig;

/// Events produced when assessing a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Warning: heartbeats are being missed but threshold not yet reached.
    Warning {
        /// Number of missed heartbeats.
        missed: u32,
        /// Elapsed seconds since last heartbeat.
        elapsed_secs: u64,
        /// Seconds until stall detection triggers.
        remaining_secs: u64,
    },
    /// Stall detected: missed heartbeats threshold has been reached.
    StallDetected {
        /// Number of missed heartbeats.
        missed: u32,
        /// Elapsed seconds since last heartbeat.
        elapsed_secs: u64,
        /// Threshold in seconds that was exceeded.
        threshold_secs: u64,
    },
}

#[derive(Debug)]
struct Pulse {
    instant: Instant,
    wall: DateTime<Utc>,
}

/// Liveness signal shared between a worker and the coordinator.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Pulse>>,
    beats: Arc<AtomicU64>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Pulse {
                instant: Instant::now(),
                wall: Utc::now(),
            })),
            beats: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records a pulse.
    pub fn pulse(&self) {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        last.instant = Instant::now();
        last.wall = Utc::now();
        self.beats.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last pulse.
    pub fn elapsed(&self) -> Duration {
        let last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        last.instant.elapsed()
    }

    /// Wall-clock time of the last pulse, for status reporting.
    pub fn last_pulse_at(&self) -> DateTime<Utc> {
        let last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        last.wall
    }

    /// Number of pulses recorded so far.
    pub fn count(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

/// Turns heartbeat silence into [`HeartbeatEvent`]s.
///
/// The monitor is stateless; the coordinator calls [`HeartbeatMonitor::assess`]
/// once per poll for each running worker.
///
/// - `Warning` once `missed_heartbeats_threshold - 1` intervals have passed
///   without a pulse.
/// - `StallDetected` once `missed_heartbeats_threshold` intervals have passed.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: TimeoutConfig,
}

impl HeartbeatMonitor {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Returns a reference to the timeout configuration.
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Assess a heartbeat for a worker that has been alive for `running_for`.
    ///
    /// Returns `None` during the startup grace period and while pulses are
    /// arriving on time.
    pub fn assess(&self, heartbeat: &Heartbeat, running_for: Duration) -> Option<HeartbeatEvent> {
        if running_for < self.config.startup_grace_period {
            return None;
        }
        self.assess_elapsed(heartbeat.elapsed())
    }

    fn assess_elapsed(&self, elapsed: Duration) -> Option<HeartbeatEvent> {
        let interval = self.config.heartbeat_interval;
        let threshold = self.config.missed_heartbeats_threshold;
        if interval.is_zero() {
            return None;
        }

        let missed = (elapsed.as_secs_f64() / interval.as_secs_f64()).floor() as u32;
        let elapsed_secs = elapsed.as_secs();
        let threshold_secs = self.config.heartbeat_timeout().as_secs();

        if missed >= threshold {
            Some(HeartbeatEvent::StallDetected {
                missed,
                elapsed_secs,
                threshold_secs,
            })
        } else if missed >= threshold.saturating_sub(1) && missed > 0 {
            Some(HeartbeatEvent::Warning {
                missed,
                elapsed_secs,
                remaining_secs: threshold_secs.saturating_sub(elapsed_secs),
            })
        } else {
            None
        }
    }
}
