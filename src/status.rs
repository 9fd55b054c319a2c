//! Status snapshot and cross-process control files.
//!
//! The coordinator rewrites `.ralph/conductor/status.json` on every monitor
//! tick. A separate `conductor` process reads it for `status`, and requests
//! pause or resume by dropping flag files into `.ralph/conductor/control/`,
//! which the coordinator picks up on its next tick.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, ConductorResult};
use crate::git::worktree::slug;
use crate::governor::ResourceUsage;
use crate::parallel::scheduler::GoalStatus;
use crate::parallel::worker::WorkerHandle;

const PAUSE_FLAG_PREFIX: &str = "pause-";
const FLAG_EXTENSION: &str = "flag";

/// Phase of the run a snapshot was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Merging,
    Completed,
    ShuttingDown,
}

/// One goal as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSnapshot {
    pub goal_id: String,
    pub title: String,
    pub wave: usize,
    pub status: GoalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Merge outcome label once merged or conflicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A live lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub path: String,
    pub holder: String,
}

/// Everything `conductor status` shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: String,
    pub phase: RunPhase,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_wave: Option<usize>,
    pub total_waves: usize,
    pub goals: Vec<GoalSnapshot>,
    pub workers: Vec<WorkerHandle>,
    pub resources: ResourceUsage,
    pub locks: Vec<LockSnapshot>,
}

impl StatusSnapshot {
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerHandle> {
        self.workers
            .iter()
            .find(|worker| worker.worker_id == worker_id)
    }

    pub fn goal(&self, goal_id: &str) -> Option<&GoalSnapshot> {
        self.goals.iter().find(|goal| goal.goal_id == goal_id)
    }

    /// Count goals per status.
    pub fn count(&self, status: GoalStatus) -> usize {
        self.goals.iter().filter(|goal| goal.status == status).count()
    }
}

/// Reads and writes the status file.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically (temp file + rename).
    pub fn save(&self, snapshot: &StatusSnapshot) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot).map_err(io::Error::other)?;
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)
    }

    /// Latest snapshot, or `None` if no run has written one.
    pub fn load(&self) -> ConductorResult<Option<StatusSnapshot>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Pause request flags, one file per paused worker.
#[derive(Debug, Clone)]
pub struct ControlDir {
    dir: PathBuf,
}

impl ControlDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn flag_path(&self, worker_id: &str) -> ConductorResult<PathBuf> {
        if worker_id.is_empty() || slug(worker_id) != worker_id {
            return Err(ConductorError::UnknownWorker(worker_id.to_string()));
        }
        Ok(self
            .dir
            .join(format!("{}{}.{}", PAUSE_FLAG_PREFIX, worker_id, FLAG_EXTENSION)))
    }

    /// Ask the coordinator to pause `worker_id`.
    pub fn request_pause(&self, worker_id: &str) -> ConductorResult<()> {
        let path = self.flag_path(worker_id)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(path, Utc::now().to_rfc3339())?;
        Ok(())
    }

    /// Withdraw a pause request. Returns true if one existed.
    pub fn clear_pause(&self, worker_id: &str) -> ConductorResult<bool> {
        let path = self.flag_path(worker_id)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Workers with an outstanding pause request.
    pub fn paused_workers(&self) -> io::Result<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err),
        };
        let mut workers = BTreeSet::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(worker_id) = name
                .strip_prefix(PAUSE_FLAG_PREFIX)
                .and_then(|rest| rest.strip_suffix(&format!(".{}", FLAG_EXTENSION)))
            {
                workers.insert(worker_id.to_string());
            }
        }
        Ok(workers)
    }

    /// Remove every pause request.
    pub fn clear_all(&self) -> io::Result<usize> {
        let workers = self.paused_workers()?;
        for worker_id in &workers {
            let path = self
                .dir
                .join(format!("{}{}.{}", PAUSE_FLAG_PREFIX, worker_id, FLAG_EXTENSION));
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(workers.len())
    }
}
