//! The surface a worker hands to its agent loop.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::git::{parse_porcelain, GitRepo};
use crate::goal::{escapes_root, normalize_path};
use crate::governor::{GovernorError, MemoryWatchdog, ResourceGovernor, Slot};
use crate::locks::{FileLockManager, LockSet};
use crate::timeout::Heartbeat;

use super::{AgentError, EditKind, FileEdit, WorkerControl};

const LOCK_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const LOCK_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Lock acquisition policy for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Wait per acquisition attempt.
    pub timeout: Duration,
    /// Extra attempts after a timeout.
    pub retry_budget: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_budget: 3,
        }
    }
}

/// Everything an agent loop may touch while working on a goal.
///
/// Writes go through [`WorkspaceContext::write_file`], which locks the path,
/// writes a temporary file and renames it into place, so a cancelled agent
/// never leaves a half-written file behind.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    worker_id: String,
    goal_id: String,
    workspace: PathBuf,
    branch: String,
    heartbeat: Heartbeat,
    control: WorkerControl,
    locks: FileLockManager,
    governor: ResourceGovernor,
    watchdog: Option<MemoryWatchdog>,
    repo: GitRepo,
    lock_policy: LockPolicy,
}

impl WorkspaceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        goal_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
        branch: impl Into<String>,
        heartbeat: Heartbeat,
        control: WorkerControl,
        locks: FileLockManager,
        governor: ResourceGovernor,
        repo: GitRepo,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            goal_id: goal_id.into(),
            workspace: workspace.into(),
            branch: branch.into(),
            heartbeat,
            control,
            locks,
            governor,
            watchdog: None,
            repo,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_watchdog(mut self, watchdog: MemoryWatchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn goal_id(&self) -> &str {
        &self.goal_id
    }

    /// Root of the worker's private checkout.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    /// Resolve a workspace-relative path. Absolute paths and `..` are
    /// rejected.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, AgentError> {
        let path = Path::new(relative);
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)));
        let key = normalize_path(relative);
        if escapes || key == "." {
            return Err(AgentError::PathEscapesWorkspace(relative.to_string()));
        }
        Ok(self.workspace.join(key))
    }

    /// Pulse the heartbeat, block while paused and fail if cancelled.
    pub async fn checkpoint(&self) -> Result<(), AgentError> {
        self.heartbeat.pulse();
        if let Some(reason) = self.control.cancel_reason() {
            return Err(AgentError::Cancelled(reason));
        }
        if self.control.is_paused() {
            tracing::info!(worker_id = %self.worker_id, goal_id = %self.goal_id, "Worker paused at checkpoint");
            self.control.wait_while_paused().await?;
            self.heartbeat.pulse();
            tracing::info!(worker_id = %self.worker_id, goal_id = %self.goal_id, "Worker resumed");
        }
        Ok(())
    }

    /// Resolves when the worker is cancelled.
    pub async fn cancelled(&self) -> super::CancelReason {
        self.control.cancelled().await
    }

    /// Lock `paths` for this worker, retrying lock timeouts within the
    /// worker's retry budget.
    pub async fn lock<I, S>(&self, paths: I) -> Result<LockSet, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if escapes_root(path) {
                return Err(AgentError::PathEscapesWorkspace(path.to_string()));
            }
            normalized.push(normalize_path(path));
        }
        let paths = normalized;
        let mut attempts: u32 = 0;
        loop {
            self.checkpoint().await?;
            attempts += 1;
            match self
                .locks
                .acquire_set(&self.worker_id, &paths, self.lock_policy.timeout)
                .await
            {
                Ok(set) => return Ok(set),
                Err(err) if attempts <= self.lock_policy.retry_budget => {
                    let delay = retry_delay(attempts);
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Lock busy; retrying"
                    );
                    tokio::select! {
                        reason = self.control.cancelled() => return Err(AgentError::Cancelled(reason)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    return Err(AgentError::LockRetriesExhausted {
                        paths,
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    /// Write `contents` to a workspace-relative path under its lock.
    pub async fn write_file(&self, relative: &str, contents: &[u8]) -> Result<FileEdit, AgentError> {
        self.checkpoint().await?;
        let target = self.resolve(relative)?;
        let key = normalize_path(relative);
        let guard = self.lock([key.as_str()]).await?;

        let kind = if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            EditKind::Modified
        } else {
            EditKind::Created
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = temp_path_for(&target);
        tokio::fs::write(&temp, contents).await?;
        if let Err(err) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err.into());
        }
        self.heartbeat.pulse();
        guard.release();

        tracing::trace!(worker_id = %self.worker_id, path = %key, "Wrote file");
        Ok(FileEdit::new(key, kind))
    }

    /// Delete a workspace-relative path under its lock.
    pub async fn remove_file(&self, relative: &str) -> Result<FileEdit, AgentError> {
        self.checkpoint().await?;
        let target = self.resolve(relative)?;
        let key = normalize_path(relative);
        let guard = self.lock([key.as_str()]).await?;
        tokio::fs::remove_file(&target).await?;
        self.heartbeat.pulse();
        guard.release();
        Ok(FileEdit::new(key, EditKind::Deleted))
    }

    /// Hold an inference slot. Waiting counts as progress: the heartbeat is
    /// pulsed each time the bounded wait expires.
    pub async fn inference_slot(&self) -> Result<Slot, AgentError> {
        loop {
            self.checkpoint().await?;
            let cancelled = async {
                self.control.cancelled().await;
            };
            match self.governor.acquire_inference_slot(cancelled).await {
                Ok(slot) => return Ok(slot),
                Err(GovernorError::Exhausted { waited, .. }) => {
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        waited_ms = waited.as_millis() as u64,
                        "Waiting for inference slot"
                    );
                }
                Err(GovernorError::Cancelled { .. }) => {
                    let reason = self
                        .control
                        .cancel_reason()
                        .unwrap_or(super::CancelReason::Shutdown);
                    return Err(AgentError::Cancelled(reason));
                }
                Err(err @ GovernorError::Closed { .. }) => {
                    return Err(AgentError::Failed(err.to_string()))
                }
            }
        }
    }

    /// Register an OS process with the memory watchdog.
    pub fn track_process(&self, pid: u32) {
        if let Some(watchdog) = self.watchdog.as_ref() {
            watchdog.track(&self.worker_id, pid);
        }
    }

    /// Uncommitted changes in the workspace.
    pub async fn pending_edits(&self) -> Result<Vec<FileEdit>, AgentError> {
        let output = self
            .repo
            .run(&self.workspace, &["status", "--porcelain", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain(&output.stdout)
            .into_iter()
            .map(|(code, path)| {
                let kind = if code == "??" || code.contains('A') {
                    EditKind::Created
                } else if code.contains('D') {
                    EditKind::Deleted
                } else {
                    EditKind::Modified
                };
                FileEdit::new(path, kind)
            })
            .collect())
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(5);
    (LOCK_RETRY_BASE_DELAY * factor).min(LOCK_RETRY_MAX_DELAY)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.conductor-tmp", name))
}


#[cfg(test)]
mod tests {
    use super::test_support::context_in;
    use super::*;
    use crate::agent::CancelReason;
    use crate::git::test_support::init_repo;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escapes() {
        let temp_dir = TempDir::new().expect("temp dir");
        let ctx = context_in(temp_dir.path(), "worker-1", FileLockManager::new());

        assert_eq!(
            ctx.resolve("src/./a.rs").expect("resolve"),
            temp_dir.path().join("src/a.rs")
        );
        assert!(matches!(
            ctx.resolve("../outside.txt"),
            Err(AgentError::PathEscapesWorkspace(_))
        ));
        assert!(ctx.resolve("/etc/passwd").is_err());
        assert!(ctx.resolve(".").is_err());
    }

    #[tokio::test]
    async fn test_lock_rejects_paths_outside_workspace() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = FileLockManager::new();
        let ctx = context_in(temp_dir.path(), "worker-1", locks.clone());

        assert!(matches!(
            ctx.lock(["a.txt", "../x"]).await,
            Err(AgentError::PathEscapesWorkspace(ref path)) if path == "../x"
        ));
        assert_eq!(locks.live_lock_count(), 0);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(30), LOCK_RETRY_MAX_DELAY);
    }

    #[tokio::test]
    async fn test_write_file_is_atomic_and_releases_lock() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = FileLockManager::new();
        let ctx = context_in(temp_dir.path(), "worker-1", locks.clone());
        let before = ctx.heartbeat().count();

        let edit = ctx.write_file("src/a.txt", b"hello\n").await.expect("write");
        assert_eq!(edit, FileEdit::new("src/a.txt", EditKind::Created));
        let edit = ctx.write_file("src/a.txt", b"again\n").await.expect("write");
        assert_eq!(edit.kind, EditKind::Modified);

        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("src/a.txt")).expect("read"),
            "again\n"
        );
        assert!(!temp_dir.path().join("src/.a.txt.conductor-tmp").exists());
        assert_eq!(locks.live_lock_count(), 0);
        assert!(ctx.heartbeat().count() > before);
    }

    #[tokio::test]
    async fn test_lock_retries_then_fails() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = FileLockManager::new();
        let _held = locks
            .acquire("worker-2", "a.txt", Duration::from_millis(10))
            .await
            .expect("lock");
        let ctx = context_in(temp_dir.path(), "worker-1", locks.clone()).with_lock_policy(
            LockPolicy {
                timeout: Duration::from_millis(20),
                retry_budget: 1,
            },
        );

        match ctx.write_file("a.txt", b"x").await {
            Err(AgentError::LockRetriesExhausted { paths, attempts, .. }) => {
                assert_eq!(paths, vec!["a.txt"]);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected lock exhaustion, got {:?}", other),
        }
        assert!(!temp_dir.path().join("a.txt").exists());
        assert_eq!(locks.held_by("worker-1"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_checkpoint_fails_once_cancelled() {
        let temp_dir = TempDir::new().expect("temp dir");
        let ctx = context_in(temp_dir.path(), "worker-1", FileLockManager::new());
        ctx.checkpoint().await.expect("running");
        ctx.control().cancel(CancelReason::MemoryLimit);
        assert!(matches!(
            ctx.checkpoint().await,
            Err(AgentError::Cancelled(CancelReason::MemoryLimit))
        ));
    }

    #[tokio::test]
    async fn test_inference_slot_is_released_on_drop() {
        let temp_dir = TempDir::new().expect("temp dir");
        let ctx = context_in(temp_dir.path(), "worker-1", FileLockManager::new());
        let slot = ctx.inference_slot().await.expect("slot");
        assert_eq!(ctx.governor.usage().inference_in_use, 1);
        drop(slot);
        assert_eq!(ctx.governor.usage().inference_in_use, 0);
    }

    #[tokio::test]
    async fn test_pending_edits_reports_changes() {
        let temp_dir = TempDir::new().expect("temp dir");
        init_repo(temp_dir.path());
        let ctx = context_in(temp_dir.path(), "worker-1", FileLockManager::new());

        ctx.write_file("new.txt", b"new\n").await.expect("write");
        std::fs::remove_file(temp_dir.path().join("README.md")).expect("remove");

        let mut edits = ctx.pending_edits().await.expect("status");
        edits.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            edits,
            vec![
                FileEdit::new("README.md", EditKind::Deleted),
                FileEdit::new("new.txt", EditKind::Created),
            ]
        );
    }
}
