//! One worker: one goal in one private snapshot.
//!
//! A worker creates a git worktree for its goal, hands it to the agent loop,
//! and either commits the result (keeping the branch for the merge step) or
//! throws the snapshot away. Whatever happens, every lock the worker holds is
//! released and its processes stop being watched.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::context::LockPolicy;
use crate::agent::{AgentError, AgentLoop, CancelReason, WorkerControl, WorkspaceContext};
use crate::error::{error_category_label, Classify};
use crate::git::worktree::slug;
use crate::git::{GitRepo, Snapshot};
use crate::goal::Goal;
use crate::governor::{MemoryWatchdog, ResourceGovernor};
use crate::locks::FileLockManager;
use crate::timeout::Heartbeat;

/// Failure reason recorded when a goal runs out of time.
pub const TIMEOUT_REASON: &str = "timeout";
/// Failure reason recorded when the memory watchdog stops a worker.
pub const MEMORY_LIMIT_REASON: &str = "memory_limit";

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Committed,
    Failed,
    TimedOut,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerStatus::Starting | WorkerStatus::Running)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Committed => "committed",
            WorkerStatus::Failed => "failed",
            WorkerStatus::TimedOut => "timed_out",
            WorkerStatus::Cancelled => "cancelled",
        }
    }
}

/// What a worker observed about its goal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub goal_id: String,
    /// Branch holding the snapshot.
    pub workspace_ref: String,
    pub base_commit: String,
    /// `None` when the agent changed nothing.
    pub commit: Option<String>,
    pub files_touched: Vec<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub success: bool,
    pub failure_reason: Option<String>,
    /// Error category label (`transient`, `fatal`, `timeout`) on failure.
    pub error_type: Option<String>,
    /// Touched files outside the goal's declared paths.
    pub undeclared_paths: Vec<String>,
    pub duration_ms: u64,
}

impl WorkerResult {
    fn new(goal_id: &str, workspace_ref: &str, base_commit: &str) -> Self {
        Self {
            goal_id: goal_id.to_string(),
            workspace_ref: workspace_ref.to_string(),
            base_commit: base_commit.to_string(),
            ..Self::default()
        }
    }
}

/// Terminal state of a worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub status: WorkerStatus,
    pub result: WorkerResult,
}

impl WorkerOutcome {
    /// Outcome for a worker the coordinator had to stop from outside.
    pub fn stopped(
        goal_id: &str,
        workspace_ref: &str,
        status: WorkerStatus,
        reason: &str,
        elapsed: Duration,
    ) -> Self {
        let mut result = WorkerResult::new(goal_id, workspace_ref, "");
        result.failure_reason = Some(reason.to_string());
        result.error_type = Some(if status == WorkerStatus::TimedOut { "timeout" } else { "fatal" }.to_string());
        result.duration_ms = elapsed.as_millis() as u64;
        Self { status, result }
    }
}

/// Coordinator-side record of a spawned worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub goal_id: String,
    pub workspace_ref: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub paused: bool,
    pub result: Option<WorkerResult>,
}

impl WorkerHandle {
    pub fn new(worker_id: &str, goal_id: &str, workspace_ref: &str) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.to_string(),
            goal_id: goal_id.to_string(),
            workspace_ref: workspace_ref.to_string(),
            status: WorkerStatus::Starting,
            started_at: now,
            last_heartbeat: now,
            paused: false,
            result: None,
        }
    }
}

/// Shared services every worker needs.
#[derive(Clone)]
pub struct WorkerEnv {
    pub repo: GitRepo,
    pub worktrees_dir: PathBuf,
    pub branch_prefix: String,
    pub locks: FileLockManager,
    pub governor: ResourceGovernor,
    pub watchdog: Option<MemoryWatchdog>,
    pub agent: Arc<dyn AgentLoop>,
    pub goal_timeout: Duration,
    pub lock_policy: LockPolicy,
}

impl WorkerEnv {
    /// Branch name for a goal's snapshot.
    pub fn branch_for(&self, goal_id: &str) -> String {
        format!("{}/{}", self.branch_prefix.trim_end_matches('/'), slug(goal_id))
    }

    pub fn worktree_for(&self, goal_id: &str) -> PathBuf {
        self.worktrees_dir.join(slug(goal_id))
    }
}

enum Stop {
    Failed(AgentError),
    TimedOut,
    Cancelled(CancelReason),
}

/// Runs one goal.
pub struct Worker {
    id: String,
    goal: Goal,
    env: WorkerEnv,
    heartbeat: Heartbeat,
    control: WorkerControl,
}

impl Worker {
    pub fn new(id: impl Into<String>, goal: Goal, env: WorkerEnv) -> Self {
        Self {
            id: id.into(),
            goal,
            env,
            heartbeat: Heartbeat::new(),
            control: WorkerControl::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    pub fn branch(&self) -> String {
        self.env.branch_for(&self.goal.id)
    }

    /// Heartbeat shared with the coordinator.
    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    /// Pause and cancel signals shared with the coordinator.
    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Run the goal from `base_commit` to a terminal outcome.
    pub async fn run(self, base_commit: String) -> WorkerOutcome {
        let started = Instant::now();
        let branch = self.branch();
        let mut result = WorkerResult::new(&self.goal.id, &branch, &base_commit);

        let snapshot = match self
            .env
            .repo
            .create_snapshot(&self.env.worktree_for(&self.goal.id), &branch, &base_commit)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(worker_id = %self.id, goal_id = %self.goal.id, error = %err, "Failed to create snapshot");
                result.failure_reason = Some(format!("snapshot: {}", err));
                result.error_type = Some(error_category_label(&err.classify()).to_string());
                self.release_resources();
                return self.finish(WorkerStatus::Failed, result, started);
            }
        };

        tracing::info!(worker_id = %self.id, goal_id = %self.goal.id, branch = %branch, "Worker running");
        let stop = self.execute(&snapshot).await;

        let status = match stop {
            Ok(()) => match self.commit(&snapshot, &mut result).await {
                Ok(()) => WorkerStatus::Committed,
                Err(err) => {
                    result.failure_reason = Some(format!("commit: {}", err));
                    result.error_type = Some(error_category_label(&err.classify()).to_string());
                    WorkerStatus::Failed
                }
            },
            Err(Stop::Failed(err)) => {
                result.failure_reason = Some(err.to_string());
                result.error_type = Some(error_category_label(&err.classify()).to_string());
                WorkerStatus::Failed
            }
            Err(Stop::TimedOut) | Err(Stop::Cancelled(CancelReason::HeartbeatTimeout)) => {
                result.failure_reason = Some(TIMEOUT_REASON.to_string());
                result.error_type = Some("timeout".to_string());
                WorkerStatus::TimedOut
            }
            Err(Stop::Cancelled(CancelReason::MemoryLimit)) => {
                result.failure_reason = Some(MEMORY_LIMIT_REASON.to_string());
                result.error_type = Some("fatal".to_string());
                WorkerStatus::Failed
            }
            Err(Stop::Cancelled(reason)) => {
                result.failure_reason = Some(reason.as_label().to_string());
                result.error_type = Some("fatal".to_string());
                WorkerStatus::Cancelled
            }
        };

        // A committed snapshot keeps its branch for the merge step.
        let keep_branch = status == WorkerStatus::Committed;
        self.env.repo.remove_snapshot(&snapshot, !keep_branch).await;
        self.release_resources();
        self.finish(status, result, started)
    }

    async fn execute(&self, snapshot: &Snapshot) -> Result<(), Stop> {
        if let Some(reason) = self.control.cancel_reason() {
            return Err(Stop::Cancelled(reason));
        }
        let mut ctx = WorkspaceContext::new(
            &self.id,
            &self.goal.id,
            &snapshot.path,
            &snapshot.branch,
            self.heartbeat.clone(),
            self.control.clone(),
            self.env.locks.clone(),
            self.env.governor.clone(),
            self.env.repo.clone(),
        )
        .with_lock_policy(self.env.lock_policy);
        if let Some(watchdog) = self.env.watchdog.as_ref() {
            ctx = ctx.with_watchdog(watchdog.clone());
        }

        self.heartbeat.pulse();
        // Cancellation reaches the agent through its checkpoints; the future
        // is never dropped mid-edit. Only the coordinator aborts a stalled task.
        let run = self
            .run_within_budget(self.env.agent.execute_goal(&self.goal, &ctx))
            .await;
        match run {
            Some(Ok(edits)) => {
                if let Some(reason) = self.control.cancel_reason() {
                    tracing::debug!(worker_id = %self.id, "Agent finished after cancellation");
                    return Err(Stop::Cancelled(reason));
                }
                tracing::debug!(worker_id = %self.id, edits = edits.len(), "Agent loop finished");
                Ok(())
            }
            Some(Err(AgentError::Cancelled(reason))) => Err(Stop::Cancelled(reason)),
            Some(Err(err)) => Err(Stop::Failed(err)),
            None => Err(Stop::TimedOut),
        }
    }

    /// Drive `run` under the goal timeout. Time spent paused does not count.
    ///
    /// Returns `None` when the budget runs out.
    async fn run_within_budget<F, T>(&self, run: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(run);
        let mut pause = self.control.pause_updates();
        let mut remaining = self.env.goal_timeout;
        loop {
            if *pause.borrow_and_update() {
                tokio::select! {
                    out = &mut run => return Some(out),
                    Ok(()) = pause.changed() => {}
                }
                continue;
            }

            let counting = Instant::now();
            tokio::select! {
                out = &mut run => return Some(out),
                _ = tokio::time::sleep(remaining) => return None,
                Ok(()) = pause.changed() => {
                    remaining = remaining.saturating_sub(counting.elapsed());
                    tracing::debug!(
                        worker_id = %self.id,
                        remaining_ms = remaining.as_millis() as u64,
                        "Goal clock stopped"
                    );
                }
            }
        }
    }

    async fn commit(
        &self,
        snapshot: &Snapshot,
        result: &mut WorkerResult,
    ) -> Result<(), crate::git::GitError> {
        let message = format!("{}: {}", self.goal.id, self.goal.title);
        let Some(commit) = self.env.repo.commit_all(snapshot, message.trim()).await? else {
            tracing::info!(worker_id = %self.id, goal_id = %self.goal.id, "Goal produced no changes");
            result.success = true;
            return Ok(());
        };

        let stats = self
            .env
            .repo
            .diff_stats(&snapshot.path, &snapshot.base_commit, &commit)
            .await?;
        result.undeclared_paths = stats
            .files
            .iter()
            .filter(|path| !self.goal.declares(path))
            .cloned()
            .collect();
        if !result.undeclared_paths.is_empty() {
            tracing::info!(
                goal_id = %self.goal.id,
                undeclared = ?result.undeclared_paths,
                "Goal touched files outside its declared paths"
            );
        }
        result.files_touched = stats.files;
        result.lines_added = stats.lines_added;
        result.lines_removed = stats.lines_removed;
        result.commit = Some(commit);
        result.success = true;
        Ok(())
    }

    fn release_resources(&self) {
        let released = self.env.locks.force_release_holder(&self.id);
        if released > 0 {
            tracing::debug!(worker_id = %self.id, released, "Released leftover locks");
        }
        if let Some(watchdog) = self.env.watchdog.as_ref() {
            watchdog.untrack(&self.id);
        }
    }

    fn finish(&self, status: WorkerStatus, mut result: WorkerResult, started: Instant) -> WorkerOutcome {
        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            worker_id = %self.id,
            goal_id = %self.goal.id,
            status = status.as_label(),
            files = result.files_touched.len(),
            duration_ms = result.duration_ms,
            reason = result.failure_reason.as_deref().unwrap_or(""),
            "Worker finished"
        );
        WorkerOutcome { status, result }
    }
}
