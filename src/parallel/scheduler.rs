//! Wave-by-wave coordination of goal workers.
//!
//! The coordinator turns a goal set into a [`Schedule`], then for each wave
//! spawns one worker per goal (bounded by the governor's worker slots),
//! watches their heartbeats, and once the wave is done merges every
//! committed result into the integration branch. Goals that do not merge
//! block everything that depends on them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::agent::context::LockPolicy;
use crate::agent::{AgentLoop, CancelReason, WorkerControl};
use crate::config::ConductorConfig;
use crate::error::{ConductorError, ConductorResult, StructuralError};
use crate::events::journal::retention_days_from_env;
use crate::events::{generate_run_id, CoordinatorEvent, EventBus, EventJournal};
use crate::git::{GitRepo, MergeStrategy, Snapshot};
use crate::goal::Goal;
use crate::governor::{GovernorConfig, MemoryBreach, MemoryWatchdog, ResourceGovernor, Slot};
use crate::layout::StateLayout;
use crate::locks::{BreadcrumbDir, FileLockManager};
use crate::metrics::{GoalMetrics, RunMetricsCollector, RunMetricsStore};
use crate::parallel::dependency::{DependencyGraph, Schedule};
use crate::parallel::reconcile::{MergeOutcome, ReconciliationEngine};
use crate::parallel::worker::{
    Worker, WorkerEnv, WorkerHandle, WorkerOutcome, WorkerResult, WorkerStatus, TIMEOUT_REASON,
};
use crate::status::{ControlDir, GoalSnapshot, LockSnapshot, RunPhase, StatusSnapshot, StatusStore};
use crate::timeout::{Heartbeat, HeartbeatEvent, HeartbeatMonitor, TimeoutConfig};

/// Failure reason for goals stopped by a global shutdown.
const SHUTDOWN_REASON: &str = "shutdown";

/// Configuration for a coordinator run.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub governor: GovernorConfig,
    pub timeouts: TimeoutConfig,
    /// Monitor cadence.
    /// Default: 500 milliseconds
    pub poll_interval: Duration,
    pub lock_policy: LockPolicy,
    /// Mirror held locks into `.ralph/locks/`.
    pub breadcrumbs: bool,
    /// Integration branch that must be checked out; `None` accepts whatever
    /// branch is current.
    pub base_branch: Option<String>,
    pub branch_prefix: String,
    pub merge_strategy: MergeStrategy,
    /// Delete worker branches once merged.
    pub cleanup_branches: bool,
    /// Refuse to start on a dirty working tree.
    pub require_clean: bool,
    /// Commit identity for worker commits as (name, email).
    pub author: Option<(String, String)>,
    pub journal: bool,
    pub retention_days: u64,
    pub persist_status: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_settings(&ConductorConfig::default())
    }
}

impl CoordinatorConfig {
    pub fn from_settings(settings: &ConductorConfig) -> Self {
        let author = match (&settings.git.author_name, &settings.git.author_email) {
            (Some(name), Some(email)) => Some((name.clone(), email.clone())),
            _ => None,
        };
        Self {
            governor: settings.governor_config(),
            timeouts: settings.timeout_config(),
            poll_interval: Duration::from_millis(settings.timeouts.poll_interval_ms),
            lock_policy: LockPolicy {
                timeout: Duration::from_secs(settings.locks.lock_timeout_secs),
                retry_budget: settings.locks.retry_budget,
            },
            breadcrumbs: settings.locks.breadcrumbs,
            base_branch: settings.git.base_branch.clone(),
            branch_prefix: settings.git.branch_prefix.clone(),
            merge_strategy: settings.git.merge_strategy,
            cleanup_branches: settings.git.cleanup_branches,
            require_clean: settings.git.require_clean,
            author,
            journal: settings.events.journal,
            retention_days: settings.events.retention_days,
            persist_status: settings.events.persist_status,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.governor.max_workers = max_workers;
        self
    }

    pub fn with_max_inference(mut self, max_inference: usize) -> Self {
        self.governor.max_inference = max_inference;
        self
    }

    pub fn with_governor(mut self, governor: GovernorConfig) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }
}

/// Where a goal stands in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Running,
    Merged,
    Conflicted,
    Failed,
    TimedOut,
    Cancelled,
    Blocked,
}

impl GoalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GoalStatus::Pending | GoalStatus::Running)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            GoalStatus::Pending => "pending",
            GoalStatus::Running => "running",
            GoalStatus::Merged => "merged",
            GoalStatus::Conflicted => "conflicted",
            GoalStatus::Failed => "failed",
            GoalStatus::TimedOut => "timed_out",
            GoalStatus::Cancelled => "cancelled",
            GoalStatus::Blocked => "blocked",
        }
    }

    fn from_worker(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Committed => {
                GoalStatus::Running
            }
            WorkerStatus::Failed => GoalStatus::Failed,
            WorkerStatus::TimedOut => GoalStatus::TimedOut,
            WorkerStatus::Cancelled => GoalStatus::Cancelled,
        }
    }
}

/// Terminal report for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalReport {
    pub goal_id: String,
    pub title: String,
    pub wave: usize,
    pub status: GoalStatus,
    pub worker_id: Option<String>,
    pub failure_reason: Option<String>,
    pub merge: Option<MergeOutcome>,
    pub duration_ms: u64,
    pub result: Option<WorkerResult>,
}

/// A merge that stopped on conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub goal_id: String,
    /// Worker branch kept for manual resolution.
    pub branch: String,
    pub files: Vec<String>,
    pub diff: String,
}

/// A goal that never ran because something it depends on did not merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedGoal {
    pub goal_id: String,
    pub blocked_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveTiming {
    pub wave: usize,
    pub goals: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTiming {
    pub total_ms: u64,
    pub waves: Vec<WaveTiming>,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorResult {
    pub run_id: String,
    /// Goals in schedule order.
    pub goals: Vec<GoalReport>,
    pub conflicts: Vec<ConflictReport>,
    pub blocked: Vec<BlockedGoal>,
    pub timing: RunTiming,
}

impl CoordinatorResult {
    /// True when every goal merged.
    pub fn all_clean(&self) -> bool {
        self.goals.iter().all(|goal| goal.status == GoalStatus::Merged)
    }

    pub fn goal(&self, goal_id: &str) -> Option<&GoalReport> {
        self.goals.iter().find(|goal| goal.goal_id == goal_id)
    }

    pub fn not_clean(&self) -> impl Iterator<Item = &GoalReport> {
        self.goals
            .iter()
            .filter(|goal| goal.status != GoalStatus::Merged)
    }

    pub fn count(&self, status: GoalStatus) -> usize {
        self.goals.iter().filter(|goal| goal.status == status).count()
    }
}

/// Triggers a global, cooperative shutdown of a run.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            tracing::info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Debug)]
struct GoalEntry {
    goal: Goal,
    wave: usize,
    status: GoalStatus,
    worker_id: Option<String>,
    failure_reason: Option<String>,
    merge: Option<MergeOutcome>,
    result: Option<WorkerResult>,
    duration_ms: u64,
}

#[derive(Debug)]
struct LiveWorker {
    handle: WorkerHandle,
    control: WorkerControl,
    heartbeat: Heartbeat,
}

#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    current_wave: Option<usize>,
    total_waves: usize,
    goals: Vec<GoalEntry>,
    workers: Vec<LiveWorker>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            current_wave: None,
            total_waves: 0,
            goals: Vec::new(),
            workers: Vec::new(),
        }
    }
}

impl RunState {
    fn goal_mut(&mut self, goal_id: &str) -> Option<&mut GoalEntry> {
        self.goals.iter_mut().find(|entry| entry.goal.id == goal_id)
    }

    fn goal(&self, goal_id: &str) -> Option<&GoalEntry> {
        self.goals.iter().find(|entry| entry.goal.id == goal_id)
    }

    fn worker_mut(&mut self, worker_id: &str) -> Option<&mut LiveWorker> {
        self.workers
            .iter_mut()
            .find(|worker| worker.handle.worker_id == worker_id)
    }
}

/// A spawned worker task the coordinator is waiting on.
struct RunningWorker {
    goal_id: String,
    branch: String,
    base_commit: String,
    started: Instant,
    heartbeat: Heartbeat,
    control: WorkerControl,
    task: JoinHandle<WorkerOutcome>,
    warned: bool,
}

/// Mutable state of the wave currently in flight.
struct WaveRun<'a> {
    index: usize,
    env: &'a WorkerEnv,
    metrics: &'a RunMetricsCollector,
    queue: VecDeque<String>,
    running: HashMap<String, RunningWorker>,
    outcomes: Vec<(String, WorkerOutcome)>,
    deferred: HashSet<String>,
}

/// Runs a goal set to completion.
pub struct Coordinator {
    layout: StateLayout,
    config: CoordinatorConfig,
    agent: Arc<dyn AgentLoop>,
    repo: GitRepo,
    locks: FileLockManager,
    governor: ResourceGovernor,
    events: EventBus,
    control: ControlDir,
    status_store: StatusStore,
    shutdown: Arc<watch::Sender<bool>>,
    state: Mutex<RunState>,
    next_worker: AtomicUsize,
}

impl Coordinator {
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: CoordinatorConfig,
        agent: Arc<dyn AgentLoop>,
    ) -> Self {
        let root = project_root.into();
        let layout = StateLayout::new(&root);

        let mut repo = GitRepo::new(&root, config.timeouts.git_timeout);
        if let Some((name, email)) = config.author.as_ref() {
            repo = repo.with_identity(name.clone(), email.clone());
        }
        let locks = if config.breadcrumbs {
            match BreadcrumbDir::new(layout.locks_dir()) {
                Ok(dir) => FileLockManager::with_breadcrumbs(dir),
                Err(err) => {
                    tracing::warn!(error = %err, "Lock breadcrumbs unavailable; locks stay in memory only");
                    FileLockManager::new()
                }
            }
        } else {
            FileLockManager::new()
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            control: ControlDir::new(layout.control_dir()),
            status_store: StatusStore::new(layout.status_file()),
            governor: ResourceGovernor::new(config.governor.clone()),
            events: EventBus::new(generate_run_id()),
            layout,
            config,
            agent,
            repo,
            locks,
            shutdown: Arc::new(shutdown),
            state: Mutex::new(RunState::default()),
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn run_id(&self) -> &str {
        self.events.run_id()
    }

    pub fn project_root(&self) -> &Path {
        self.layout.project_root()
    }

    pub fn lock_manager(&self) -> &FileLockManager {
        &self.locks
    }

    /// Validate a goal set and compute its schedule without running anything.
    pub fn plan(goals: &[Goal]) -> Result<Schedule, StructuralError> {
        DependencyGraph::build(goals)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    /// Pause a running worker at its next checkpoint. It keeps its locks.
    pub fn pause(&self, worker_id: &str) -> ConductorResult<()> {
        self.ensure_known_worker(worker_id)?;
        self.control.request_pause(worker_id)?;
        self.apply_pause(worker_id, true);
        Ok(())
    }

    /// Resume a paused worker with a fresh heartbeat.
    pub fn resume(&self, worker_id: &str) -> ConductorResult<()> {
        self.ensure_known_worker(worker_id)?;
        self.control.clear_pause(worker_id)?;
        self.apply_pause(worker_id, false);
        Ok(())
    }

    /// Current view of the run.
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state();
        StatusSnapshot {
            run_id: self.events.run_id().to_string(),
            phase: state.phase,
            updated_at: Utc::now(),
            current_wave: state.current_wave,
            total_waves: state.total_waves,
            goals: state
                .goals
                .iter()
                .map(|entry| GoalSnapshot {
                    goal_id: entry.goal.id.clone(),
                    title: entry.goal.title.clone(),
                    wave: entry.wave,
                    status: entry.status,
                    worker_id: entry.worker_id.clone(),
                    merge: entry.merge.as_ref().map(|merge| merge.as_label().to_string()),
                    failure_reason: entry.failure_reason.clone(),
                })
                .collect(),
            workers: state
                .workers
                .iter()
                .map(|worker| {
                    let mut handle = worker.handle.clone();
                    if !handle.status.is_terminal() {
                        handle.last_heartbeat = worker.heartbeat.last_pulse_at();
                    }
                    handle
                })
                .collect(),
            resources: self.governor.usage(),
            locks: self
                .locks
                .holders()
                .into_iter()
                .map(|(path, holder)| LockSnapshot { path, holder })
                .collect(),
        }
    }

    /// Run every goal. Structural problems are returned before anything is
    /// spawned; everything else ends up in the result.
    pub async fn execute(&self, goals: Vec<Goal>) -> ConductorResult<CoordinatorResult> {
        let started = Instant::now();
        let graph = DependencyGraph::new(&goals)?;
        let schedule = graph.schedule();
        let base_branch = self.prepare().await?;

        tracing::info!(
            run_id = %self.run_id(),
            goals = graph.len(),
            waves = schedule.len(),
            conflicts = schedule.conflicts().len(),
            base_branch = %base_branch,
            "Starting run"
        );
        self.init_state(&graph, &schedule);
        self.events.emit(CoordinatorEvent::RunStarted {
            goals: graph.len(),
            waves: schedule.len(),
        });
        let metrics = RunMetricsCollector::new(self.run_id(), graph.len());

        let watchdog = (self.config.governor.max_memory_mb_per_worker > 0).then(|| {
            MemoryWatchdog::new(
                self.config.governor.max_memory_mb_per_worker,
                self.config.governor.memory_poll_interval,
            )
        });
        let (breach_tx, mut breaches) = mpsc::channel::<MemoryBreach>(16);
        let (watchdog_stop, watchdog_stop_rx) = watch::channel(false);
        let watchdog_task = watchdog
            .as_ref()
            .map(|watchdog| watchdog.spawn(breach_tx, watchdog_stop_rx));

        let env = WorkerEnv {
            repo: self.repo.clone(),
            worktrees_dir: self.layout.worktrees_dir(),
            branch_prefix: self.config.branch_prefix.clone(),
            locks: self.locks.clone(),
            governor: self.governor.clone(),
            watchdog,
            agent: self.agent.clone(),
            goal_timeout: self.config.timeouts.goal_timeout,
            lock_policy: self.config.lock_policy,
        };
        let engine = ReconciliationEngine::new(self.repo.clone(), self.config.merge_strategy)
            .with_cleanup_branches(self.config.cleanup_branches);
        let monitor = HeartbeatMonitor::new(self.config.timeouts.clone());

        let mut timing = RunTiming::default();
        let mut conflicts = Vec::new();
        let mut blocked = Vec::new();

        for wave in &schedule.waves {
            if self.is_shutting_down() {
                break;
            }
            let runnable: Vec<String> = wave
                .goals
                .iter()
                .filter(|goal_id| self.goal_status(goal_id) == Some(GoalStatus::Pending))
                .cloned()
                .collect();
            if runnable.is_empty() {
                tracing::debug!(wave = wave.index, "Skipping wave with no runnable goals");
                continue;
            }

            let wave_started = Instant::now();
            {
                let mut state = self.state();
                state.current_wave = Some(wave.index);
                state.phase = RunPhase::Running;
            }
            tracing::info!(wave = wave.index, goals = ?runnable, "Starting wave");
            self.events.emit(CoordinatorEvent::WaveStarted {
                wave: wave.index,
                goals: runnable.clone(),
            });

            let mut run = WaveRun {
                index: wave.index,
                env: &env,
                metrics: &metrics,
                queue: runnable.iter().cloned().collect(),
                running: HashMap::new(),
                outcomes: Vec::new(),
                deferred: HashSet::new(),
            };
            loop {
                let waited = self.spawn_ready(&graph, &mut run).await;
                if run.queue.is_empty() && run.running.is_empty() {
                    break;
                }
                if !waited {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                self.monitor_tick(&monitor, &mut run, &mut breaches).await;
            }

            self.state().phase = RunPhase::Merging;
            self.persist_status();
            let mut outcomes = std::mem::take(&mut run.outcomes);
            outcomes.sort_by(|(a, _), (b, _)| graph.launch_order(a, b));
            for (goal_id, outcome) in &outcomes {
                let Some(goal) = graph.goal(goal_id) else { continue };
                if outcome.status != WorkerStatus::Committed {
                    let reason = outcome
                        .result
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| outcome.status.as_label().to_string());
                    if let Some(entry) = self.state().goal_mut(goal_id) {
                        entry.merge = Some(MergeOutcome::Discarded { reason });
                    }
                    continue;
                }
                let merge = match engine.reconcile(goal, outcome).await {
                    Ok(merge) => merge,
                    Err(err) => {
                        tracing::error!(goal_id = %goal_id, error = %err, "Merge failed");
                        MergeOutcome::Discarded {
                            reason: format!("merge failed: {}", err),
                        }
                    }
                };
                if let Some(conflict) = self.record_merge(goal_id, &merge, &metrics) {
                    conflicts.push(conflict);
                }
            }

            for goal_id in &runnable {
                if self.goal_status(goal_id) == Some(GoalStatus::Merged) {
                    continue;
                }
                for dependent in graph.dependents_of(goal_id) {
                    if self.mark_blocked(&dependent, goal_id) {
                        metrics.record_blocked();
                        blocked.push(BlockedGoal {
                            goal_id: dependent,
                            blocked_by: goal_id.clone(),
                        });
                    }
                }
            }

            let elapsed = wave_started.elapsed();
            metrics.record_wave(wave.index, runnable.len(), elapsed);
            timing.waves.push(WaveTiming {
                wave: wave.index,
                goals: runnable.len(),
                duration_ms: elapsed.as_millis() as u64,
            });
            self.events.emit(CoordinatorEvent::WaveCompleted {
                wave: wave.index,
                duration_ms: elapsed.as_millis() as u64,
            });
            self.persist_status();
        }

        let _ = watchdog_stop.send(true);
        if let Some(task) = watchdog_task {
            task.abort();
        }
        self.cancel_unstarted();
        if let Err(err) = self.control.clear_all() {
            tracing::debug!(error = %err, "Failed to clear pause requests");
        }

        timing.total_ms = started.elapsed().as_millis() as u64;
        let result = self.build_result(conflicts, blocked, timing);
        self.state().phase = RunPhase::Completed;
        self.persist_status();
        self.save_metrics(&metrics);

        let merged = result.count(GoalStatus::Merged);
        tracing::info!(
            run_id = %result.run_id,
            merged,
            not_clean = result.goals.len() - merged,
            conflicts = result.conflicts.len(),
            blocked = result.blocked.len(),
            duration_ms = result.timing.total_ms,
            "Run completed"
        );
        self.events.emit(CoordinatorEvent::RunCompleted {
            all_clean: result.all_clean(),
            merged,
            not_clean: result.goals.len() - merged,
            duration_ms: result.timing.total_ms,
        });
        Ok(result)
    }

    /// Check the repository and create the state directory. Returns the
    /// integration branch.
    async fn prepare(&self) -> ConductorResult<String> {
        let root = self.project_root().to_path_buf();
        if !self.repo.is_repository().await {
            return Err(ConductorError::NotARepository(root));
        }
        let current = self
            .repo
            .current_branch()
            .await?
            .ok_or(ConductorError::DetachedHead)?;
        if let Some(expected) = self.config.base_branch.as_ref() {
            if expected != &current {
                return Err(ConductorError::WrongBranch {
                    expected: expected.clone(),
                    actual: current,
                });
            }
        }

        self.layout.ensure()?;
        if self.config.require_clean {
            let dirty = self.repo.dirty_files(&root).await?;
            if !dirty.is_empty() {
                return Err(ConductorError::DirtyWorkingTree { files: dirty });
            }
        }

        let stale = self.locks.recover_stale();
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "Recovered stale lock breadcrumbs from a previous run");
        }
        if let Err(err) = self.control.clear_all() {
            tracing::debug!(error = %err, "Failed to clear stale pause requests");
        }

        if self.config.journal {
            let retention_days = retention_days_from_env(self.config.retention_days);
            match EventJournal::new(self.layout.runs_dir(), retention_days) {
                Ok(journal) => {
                    match journal.enforce_retention() {
                        Ok(0) => {}
                        Ok(pruned) => tracing::info!(pruned, "Pruned old run journals"),
                        Err(err) => tracing::warn!(error = %err, "Failed to prune run journals"),
                    }
                    self.events.attach_journal(journal);
                }
                Err(err) => tracing::warn!(error = %err, "Event journal unavailable"),
            }
        }
        Ok(current)
    }

    fn init_state(&self, graph: &DependencyGraph, schedule: &Schedule) {
        let mut state = self.state();
        *state = RunState {
            phase: RunPhase::Running,
            current_wave: None,
            total_waves: schedule.len(),
            goals: schedule
                .waves
                .iter()
                .flat_map(|wave| wave.goals.iter().map(move |id| (wave.index, id)))
                .filter_map(|(wave, id)| {
                    graph.goal(id).map(|goal| GoalEntry {
                        goal: goal.clone(),
                        wave,
                        status: GoalStatus::Pending,
                        worker_id: None,
                        failure_reason: None,
                        merge: None,
                        result: None,
                        duration_ms: 0,
                    })
                })
                .collect(),
            workers: Vec::new(),
        };
    }

    /// Spawn queued goals while worker slots are free. Returns true if it
    /// spent time waiting for a slot.
    async fn spawn_ready(&self, graph: &DependencyGraph, run: &mut WaveRun<'_>) -> bool {
        while let Some(goal_id) = run.queue.front().cloned() {
            if self.is_shutting_down() {
                return false;
            }
            let slot = match self.governor.try_acquire_worker_slot() {
                Some(slot) => slot,
                None => {
                    let mut shutdown = self.shutdown.subscribe();
                    let poll = self.config.poll_interval;
                    let waited = self
                        .governor
                        .acquire_worker_slot(async move {
                            tokio::select! {
                                _ = tokio::time::sleep(poll) => {}
                                _ = shutdown.wait_for(|stop| *stop) => {}
                            }
                        })
                        .await;
                    match waited {
                        Ok(slot) => slot,
                        Err(err) => {
                            if run.deferred.insert(goal_id.clone()) {
                                let usage = self.governor.usage();
                                let reason = format!(
                                    "no worker slot free ({}/{} in use)",
                                    usage.workers_in_use, usage.workers_total
                                );
                                tracing::info!(goal_id = %goal_id, error = %err, "Deferring spawn");
                                run.metrics.record_deferral(&goal_id, run.index);
                                self.events.emit(CoordinatorEvent::SpawnDeferred {
                                    goal_id: goal_id.clone(),
                                    reason,
                                });
                            }
                            return true;
                        }
                    }
                }
            };
            run.queue.pop_front();
            let Some(goal) = graph.goal(&goal_id).cloned() else {
                continue;
            };
            self.spawn_worker(goal, slot, run).await;
        }
        false
    }

    async fn spawn_worker(&self, goal: Goal, slot: Slot, run: &mut WaveRun<'_>) {
        let base_commit = match self.repo.rev_parse(self.repo.root(), "HEAD").await {
            Ok(commit) => commit,
            Err(err) => {
                tracing::error!(goal_id = %goal.id, error = %err, "Could not read integration head");
                self.finish_unspawned(
                    &goal.id,
                    GoalStatus::Failed,
                    &format!("could not read integration head: {}", err),
                );
                return;
            }
        };

        let worker_id = format!("worker-{}", self.next_worker.fetch_add(1, Ordering::SeqCst) + 1);
        let worker = Worker::new(worker_id.clone(), goal.clone(), run.env.clone());
        let branch = worker.branch();
        let heartbeat = worker.heartbeat();
        let control = worker.control();
        let task_base = base_commit.clone();
        let task = tokio::spawn(async move {
            let _slot = slot;
            worker.run(task_base).await
        });

        {
            let mut state = self.state();
            let mut handle = WorkerHandle::new(&worker_id, &goal.id, &branch);
            handle.status = WorkerStatus::Running;
            state.workers.push(LiveWorker {
                handle,
                control: control.clone(),
                heartbeat: heartbeat.clone(),
            });
            if let Some(entry) = state.goal_mut(&goal.id) {
                entry.status = GoalStatus::Running;
                entry.worker_id = Some(worker_id.clone());
            }
        }
        run.metrics.start_goal(&goal.id, run.index);
        tracing::info!(worker_id = %worker_id, goal_id = %goal.id, wave = run.index, "Spawned worker");
        self.events.emit(CoordinatorEvent::WorkerSpawned {
            worker_id: worker_id.clone(),
            goal_id: goal.id.clone(),
            wave: run.index,
            branch: branch.clone(),
        });

        run.running.insert(
            worker_id,
            RunningWorker {
                goal_id: goal.id,
                branch,
                base_commit,
                started: Instant::now(),
                heartbeat,
                control,
                task,
                warned: false,
            },
        );
    }

    async fn monitor_tick(
        &self,
        monitor: &HeartbeatMonitor,
        run: &mut WaveRun<'_>,
        breaches: &mut mpsc::Receiver<MemoryBreach>,
    ) {
        while let Ok(breach) = breaches.try_recv() {
            if let Some(worker) = run.running.get(&breach.worker_id) {
                tracing::warn!(
                    worker_id = %breach.worker_id,
                    resident_mb = breach.resident_mb,
                    ceiling_mb = breach.ceiling_mb,
                    "Cancelling worker over its memory ceiling"
                );
                worker.control.cancel(CancelReason::MemoryLimit);
            }
        }

        if self.is_shutting_down() {
            self.state().phase = RunPhase::ShuttingDown;
            for worker in run.running.values() {
                worker.control.cancel(CancelReason::Shutdown);
            }
            while let Some(goal_id) = run.queue.pop_front() {
                self.finish_unspawned(&goal_id, GoalStatus::Cancelled, SHUTDOWN_REASON);
            }
        }

        self.sync_pause_requests();

        let finished: Vec<String> = run
            .running
            .iter()
            .filter(|(_, worker)| worker.task.is_finished())
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        for worker_id in finished {
            let Some(mut worker) = run.running.remove(&worker_id) else { continue };
            let outcome = match (&mut worker.task).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(worker_id = %worker_id, error = %err, "Worker task failed");
                    self.discard_worker(run.env, &worker_id, &worker).await;
                    WorkerOutcome::stopped(
                        &worker.goal_id,
                        &worker.branch,
                        WorkerStatus::Failed,
                        &format!("worker task failed: {}", err),
                        worker.started.elapsed(),
                    )
                }
            };
            self.record_outcome(&worker_id, &worker, outcome, run);
        }

        let mut stalled = Vec::new();
        for (worker_id, worker) in run.running.iter_mut() {
            if worker.control.is_paused() {
                continue;
            }
            match monitor.assess(&worker.heartbeat, worker.started.elapsed()) {
                Some(HeartbeatEvent::Warning {
                    missed,
                    remaining_secs,
                    ..
                }) => {
                    if !worker.warned {
                        worker.warned = true;
                        tracing::warn!(
                            worker_id = %worker_id,
                            goal_id = %worker.goal_id,
                            missed,
                            remaining_secs,
                            "Worker is missing heartbeats"
                        );
                    }
                }
                Some(HeartbeatEvent::StallDetected {
                    elapsed_secs,
                    threshold_secs,
                    ..
                }) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        goal_id = %worker.goal_id,
                        elapsed_secs,
                        threshold_secs,
                        "Worker stalled; aborting"
                    );
                    stalled.push(worker_id.clone());
                }
                None => worker.warned = false,
            }
        }
        let mut aborted: Vec<(String, RunningWorker)> = stalled
            .into_iter()
            .filter_map(|worker_id| run.running.remove(&worker_id).map(|worker| (worker_id, worker)))
            .collect();
        for (_, worker) in &aborted {
            worker.control.cancel(CancelReason::HeartbeatTimeout);
            worker.task.abort();
        }
        let joined =
            futures::future::join_all(aborted.iter_mut().map(|(_, worker)| &mut worker.task)).await;
        for ((worker_id, worker), joined) in aborted.into_iter().zip(joined) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.discard_worker(run.env, &worker_id, &worker).await;
                    WorkerOutcome::stopped(
                        &worker.goal_id,
                        &worker.branch,
                        WorkerStatus::TimedOut,
                        TIMEOUT_REASON,
                        worker.started.elapsed(),
                    )
                }
            };
            self.record_outcome(&worker_id, &worker, outcome, run);
        }

        self.persist_status();
    }

    /// Clean up after a worker task that never reached its own cleanup.
    async fn discard_worker(&self, env: &WorkerEnv, worker_id: &str, worker: &RunningWorker) {
        let released = self.locks.force_release_holder(worker_id);
        if released > 0 {
            tracing::info!(worker_id, released, "Force-released locks of stopped worker");
        }
        if let Some(watchdog) = env.watchdog.as_ref() {
            watchdog.untrack(worker_id);
        }
        let snapshot = Snapshot {
            path: env.worktree_for(&worker.goal_id),
            branch: worker.branch.clone(),
            base_commit: worker.base_commit.clone(),
        };
        self.repo.remove_snapshot(&snapshot, true).await;
    }

    fn record_outcome(
        &self,
        worker_id: &str,
        worker: &RunningWorker,
        mut outcome: WorkerOutcome,
        run: &mut WaveRun<'_>,
    ) {
        if outcome.result.base_commit.is_empty() {
            outcome.result.base_commit = worker.base_commit.clone();
        }
        let status = outcome.status;
        let goal_status = GoalStatus::from_worker(status);
        let wave = {
            let mut state = self.state();
            if let Some(live) = state.worker_mut(worker_id) {
                live.handle.status = status;
                live.handle.paused = false;
                live.handle.last_heartbeat = worker.heartbeat.last_pulse_at();
                live.handle.result = Some(outcome.result.clone());
            }
            match state.goal_mut(&worker.goal_id) {
                Some(entry) => {
                    entry.result = Some(outcome.result.clone());
                    entry.duration_ms = outcome.result.duration_ms;
                    if goal_status.is_terminal() {
                        entry.status = goal_status;
                        entry.failure_reason = outcome.result.failure_reason.clone();
                    }
                    entry.wave
                }
                None => run.index,
            }
        };

        self.events.emit(CoordinatorEvent::WorkerCompleted {
            worker_id: worker_id.to_string(),
            goal_id: worker.goal_id.clone(),
            status,
            failure_reason: outcome.result.failure_reason.clone(),
            error_type: outcome.result.error_type.clone(),
            duration_ms: outcome.result.duration_ms,
        });
        if goal_status.is_terminal() {
            run.metrics
                .complete_goal(goal_metrics(&worker.goal_id, wave, goal_status, &outcome.result));
        }
        run.outcomes.push((worker.goal_id.clone(), outcome));
    }

    /// Apply a merge outcome. Returns the conflict report for conflicts.
    fn record_merge(
        &self,
        goal_id: &str,
        merge: &MergeOutcome,
        metrics: &RunMetricsCollector,
    ) -> Option<ConflictReport> {
        let (status, reason) = match merge {
            MergeOutcome::Clean { .. } => (GoalStatus::Merged, None),
            MergeOutcome::Conflicted { files, .. } => (
                GoalStatus::Conflicted,
                Some(format!("merge conflict in {}", files.join(", "))),
            ),
            MergeOutcome::Discarded { reason } => (GoalStatus::Failed, Some(reason.clone())),
        };

        let (wave, result) = {
            let mut state = self.state();
            let Some(entry) = state.goal_mut(goal_id) else {
                return None;
            };
            entry.status = status;
            entry.failure_reason = reason;
            entry.merge = Some(merge.clone());
            (entry.wave, entry.result.clone().unwrap_or_default())
        };
        metrics.complete_goal(goal_metrics(goal_id, wave, status, &result));

        match merge {
            MergeOutcome::Clean { commit } => {
                self.events.emit(CoordinatorEvent::GoalMerged {
                    goal_id: goal_id.to_string(),
                    commit: commit.clone(),
                });
                None
            }
            MergeOutcome::Conflicted {
                files,
                diff,
                branch,
            } => {
                metrics.record_conflict();
                self.events.emit(CoordinatorEvent::MergeConflicted {
                    goal_id: goal_id.to_string(),
                    files: files.clone(),
                });
                Some(ConflictReport {
                    goal_id: goal_id.to_string(),
                    branch: branch.clone(),
                    files: files.clone(),
                    diff: diff.clone(),
                })
            }
            MergeOutcome::Discarded { .. } => None,
        }
    }

    /// Mark a pending goal blocked. Returns false if it already left pending.
    fn mark_blocked(&self, goal_id: &str, blocked_by: &str) -> bool {
        {
            let mut state = self.state();
            let Some(entry) = state.goal_mut(goal_id) else {
                return false;
            };
            if entry.status != GoalStatus::Pending {
                return false;
            }
            entry.status = GoalStatus::Blocked;
            entry.failure_reason = Some(format!("blocked by {}", blocked_by));
        }
        tracing::info!(goal_id, blocked_by, "Goal blocked");
        self.events.emit(CoordinatorEvent::GoalBlocked {
            goal_id: goal_id.to_string(),
            blocked_by: blocked_by.to_string(),
        });
        true
    }

    fn finish_unspawned(&self, goal_id: &str, status: GoalStatus, reason: &str) {
        let mut state = self.state();
        if let Some(entry) = state.goal_mut(goal_id) {
            if !entry.status.is_terminal() {
                entry.status = status;
                entry.failure_reason = Some(reason.to_string());
            }
        }
    }

    fn cancel_unstarted(&self) {
        let mut state = self.state();
        for entry in state.goals.iter_mut() {
            if entry.status == GoalStatus::Pending {
                entry.status = GoalStatus::Cancelled;
                entry.failure_reason = Some(SHUTDOWN_REASON.to_string());
            }
        }
    }

    fn ensure_known_worker(&self, worker_id: &str) -> ConductorResult<()> {
        let state = self.state();
        if state
            .workers
            .iter()
            .any(|worker| worker.handle.worker_id == worker_id)
        {
            Ok(())
        } else {
            Err(ConductorError::UnknownWorker(worker_id.to_string()))
        }
    }

    /// Pause or resume a live worker. Returns true if its state changed.
    fn apply_pause(&self, worker_id: &str, paused: bool) -> bool {
        let event = {
            let mut state = self.state();
            let Some(worker) = state.worker_mut(worker_id) else {
                return false;
            };
            if worker.handle.status.is_terminal() {
                return false;
            }
            let changed = if paused {
                worker.control.pause()
            } else {
                worker.control.resume()
            };
            if !changed {
                return false;
            }
            worker.handle.paused = paused;
            let worker_id = worker.handle.worker_id.clone();
            let goal_id = worker.handle.goal_id.clone();
            if paused {
                CoordinatorEvent::WorkerPaused { worker_id, goal_id }
            } else {
                worker.heartbeat.pulse();
                CoordinatorEvent::WorkerResumed { worker_id, goal_id }
            }
        };
        tracing::info!(worker_id, paused, "Worker pause state changed");
        self.events.emit(event);
        true
    }

    /// Apply pause flags written by other processes.
    fn sync_pause_requests(&self) {
        let requested = match self.control.paused_workers() {
            Ok(requested) => requested,
            Err(err) => {
                tracing::debug!(error = %err, "Failed to read pause requests");
                return;
            }
        };
        let live: Vec<(String, bool)> = self
            .state()
            .workers
            .iter()
            .filter(|worker| !worker.handle.status.is_terminal())
            .map(|worker| (worker.handle.worker_id.clone(), worker.handle.paused))
            .collect();
        for (worker_id, paused) in live {
            let wanted = requested.contains(&worker_id);
            if wanted != paused {
                self.apply_pause(&worker_id, wanted);
            }
        }
    }

    fn build_result(
        &self,
        conflicts: Vec<ConflictReport>,
        blocked: Vec<BlockedGoal>,
        timing: RunTiming,
    ) -> CoordinatorResult {
        let state = self.state();
        CoordinatorResult {
            run_id: self.run_id().to_string(),
            goals: state
                .goals
                .iter()
                .map(|entry| GoalReport {
                    goal_id: entry.goal.id.clone(),
                    title: entry.goal.title.clone(),
                    wave: entry.wave,
                    status: entry.status,
                    worker_id: entry.worker_id.clone(),
                    failure_reason: entry.failure_reason.clone(),
                    merge: entry.merge.clone(),
                    duration_ms: entry.duration_ms,
                    result: entry.result.clone(),
                })
                .collect(),
            conflicts,
            blocked,
            timing,
        }
    }

    fn persist_status(&self) {
        if !self.config.persist_status {
            return;
        }
        if let Err(err) = self.status_store.save(&self.snapshot()) {
            tracing::debug!(error = %err, path = %self.status_store.path().display(), "Failed to write status");
        }
    }

    fn save_metrics(&self, metrics: &RunMetricsCollector) {
        match RunMetricsStore::new(self.layout.metrics_dir()) {
            Ok(store) => {
                if let Err(err) = store.save(&metrics.finish()) {
                    tracing::warn!(error = %err, "Failed to save run metrics");
                }
            }
            Err(err) => tracing::warn!(error = %err, "Failed to initialize run metrics store"),
        }
    }

    fn goal_status(&self, goal_id: &str) -> Option<GoalStatus> {
        self.state().goal(goal_id).map(|entry| entry.status)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn goal_metrics(goal_id: &str, wave: usize, status: GoalStatus, result: &WorkerResult) -> GoalMetrics {
    GoalMetrics {
        goal_id: goal_id.to_string(),
        wave,
        deferrals: 0,
        duration_ms: result.duration_ms,
        status: status.as_label().to_string(),
        success: status == GoalStatus::Merged,
        files_touched: result.files_touched.len(),
        lines_added: result.lines_added,
        lines_removed: result.lines_removed,
        error: result.failure_reason.clone(),
        error_type: result.error_type.clone(),
    }
}
