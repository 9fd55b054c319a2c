//! Coordinator lifecycle events.
//!
//! Events fan out over a tokio broadcast channel to any number of live
//! subscribers and, when a journal is attached, are appended to the run's
//! `events.jsonl`.

pub mod journal;

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::parallel::worker::WorkerStatus;

pub use journal::{EventJournal, JournalError, JournalRecord, RunManifest};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    RunStarted {
        goals: usize,
        waves: usize,
    },
    WaveStarted {
        wave: usize,
        goals: Vec<String>,
    },
    WorkerSpawned {
        worker_id: String,
        goal_id: String,
        wave: usize,
        branch: String,
    },
    /// No worker slot was free; the goal will be retried.
    SpawnDeferred {
        goal_id: String,
        reason: String,
    },
    WorkerPaused {
        worker_id: String,
        goal_id: String,
    },
    WorkerResumed {
        worker_id: String,
        goal_id: String,
    },
    WorkerCompleted {
        worker_id: String,
        goal_id: String,
        status: WorkerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        duration_ms: u64,
    },
    GoalMerged {
        goal_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
    MergeConflicted {
        goal_id: String,
        files: Vec<String>,
    },
    GoalBlocked {
        goal_id: String,
        blocked_by: String,
    },
    WaveCompleted {
        wave: usize,
        duration_ms: u64,
    },
    RunCompleted {
        all_clean: bool,
        merged: usize,
        not_clean: usize,
        duration_ms: u64,
    },
}

impl CoordinatorEvent {
    /// Stable snake_case name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::RunStarted { .. } => "run_started",
            CoordinatorEvent::WaveStarted { .. } => "wave_started",
            CoordinatorEvent::WorkerSpawned { .. } => "worker_spawned",
            CoordinatorEvent::SpawnDeferred { .. } => "spawn_deferred",
            CoordinatorEvent::WorkerPaused { .. } => "worker_paused",
            CoordinatorEvent::WorkerResumed { .. } => "worker_resumed",
            CoordinatorEvent::WorkerCompleted { .. } => "worker_completed",
            CoordinatorEvent::GoalMerged { .. } => "goal_merged",
            CoordinatorEvent::MergeConflicted { .. } => "merge_conflicted",
            CoordinatorEvent::GoalBlocked { .. } => "goal_blocked",
            CoordinatorEvent::WaveCompleted { .. } => "wave_completed",
            CoordinatorEvent::RunCompleted { .. } => "run_completed",
        }
    }
}

/// Generate a run id from the wall clock and process id.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{}-{}", timestamp_ms, std::process::id())
}

/// Publishes events to subscribers and the optional journal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    run_id: String,
    sender: broadcast::Sender<CoordinatorEvent>,
    journal: Arc<Mutex<Option<EventJournal>>>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            run_id: run_id.into(),
            sender,
            journal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_journal(self, journal: EventJournal) -> Self {
        self.attach_journal(journal);
        self
    }

    /// Start journaling. Applies to every clone of this bus.
    pub fn attach_journal(&self, journal: EventJournal) {
        *self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(journal);
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Journal failures are logged, never propagated.
    pub fn emit(&self, event: CoordinatorEvent) {
        tracing::debug!(run_id = %self.run_id, event = event.name(), "Coordinator event");
        let journal = self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(journal) = journal.as_ref() {
            let record = JournalRecord::new(self.run_id.clone(), event.clone());
            if let Err(err) = journal.append(&record) {
                tracing::warn!(
                    run_id = %self.run_id,
                    dir = %journal.runs_dir().display(),
                    error = %err,
                    "Failed to journal event"
                );
            }
        }
        drop(journal);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
