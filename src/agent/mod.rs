//! The agent loop seam.
//!
//! A worker hands its goal and a [`WorkspaceContext`] to an [`AgentLoop`],
//! which produces edits inside the worker's private snapshot. The model call
//! itself lives behind this trait; [`CommandAgent`] drives an external
//! command, tests use scripted implementations.

pub mod command;
pub mod context;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::git::GitError;
use crate::goal::Goal;
use crate::locks::LockError;

pub use command::CommandAgent;
pub use context::WorkspaceContext;

/// Why a worker was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit request for this worker.
    Operator,
    /// The whole run is shutting down.
    Shutdown,
    /// The memory watchdog saw the worker above its ceiling.
    MemoryLimit,
    /// The coordinator stopped hearing from the worker.
    HeartbeatTimeout,
}

impl CancelReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            CancelReason::Operator => "cancelled",
            CancelReason::Shutdown => "shutdown",
            CancelReason::MemoryLimit => "memory_limit",
            CancelReason::HeartbeatTimeout => "timeout",
        }
    }
}

/// Errors an agent loop can end with. All of them fail the goal.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),

    #[error("cancelled ({})", .0.as_label())]
    Cancelled(CancelReason),

    #[error("could not lock {} after {attempts} attempts: {source}", paths.join(", "))]
    LockRetriesExhausted {
        paths: Vec<String>,
        attempts: u32,
        #[source]
        source: LockError,
    },

    #[error("path '{0}' escapes the workspace")]
    PathEscapesWorkspace(String),

    #[error("agent command exited with {code:?}: {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of change an agent made to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Created,
    Modified,
    Deleted,
}

/// One file changed by an agent, relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub kind: EditKind,
}

impl FileEdit {
    pub fn new(path: impl Into<String>, kind: EditKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Produces edits for one goal inside a workspace.
///
/// Implementations should call [`WorkspaceContext::checkpoint`] regularly;
/// that is where heartbeats, pause requests and cancellation are observed.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    async fn execute_goal(
        &self,
        goal: &Goal,
        ctx: &WorkspaceContext,
    ) -> Result<Vec<FileEdit>, AgentError>;
}

/// Pause and cancel signals for one worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    pause: Arc<watch::Sender<bool>>,
    cancel: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        let (cancel, _) = watch::channel(None);
        Self {
            pause: Arc::new(pause),
            cancel: Arc::new(cancel),
        }
    }

    /// Returns true if the state changed.
    pub fn pause(&self) -> bool {
        !self.pause.send_replace(true)
    }

    /// Returns true if the state changed.
    pub fn resume(&self) -> bool {
        self.pause.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Receiver that observes pause and resume.
    pub fn pause_updates(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }

    /// Request cancellation. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.cancel.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) -> CancelReason {
        let mut receiver = self.cancel.subscribe();
        let reason = receiver
            .wait_for(|reason| reason.is_some())
            .await
            .ok()
            .and_then(|reason| *reason);
        match reason {
            Some(reason) => reason,
            // The sender lives as long as `self`.
            None => std::future::pending().await,
        }
    }

    /// Wait until resumed. Fails if cancelled while paused.
    pub async fn wait_while_paused(&self) -> Result<(), AgentError> {
        let mut paused = self.pause.subscribe();
        tokio::select! {
            reason = self.cancelled() => Err(AgentError::Cancelled(reason)),
            _ = paused.wait_for(|paused| !*paused) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_reason_labels() {
        assert_eq!(CancelReason::HeartbeatTimeout.as_label(), "timeout");
        assert_eq!(CancelReason::MemoryLimit.as_label(), "memory_limit");
        assert_eq!(
            AgentError::Cancelled(CancelReason::Shutdown).to_string(),
            "cancelled (shutdown)"
        );
    }

    #[test]
    fn test_pause_and_resume_report_changes() {
        let control = WorkerControl::new();
        assert!(!control.is_paused());
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.is_paused());
        assert!(control.resume());
        assert!(!control.resume());
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let control = WorkerControl::new();
        control.cancel(CancelReason::MemoryLimit);
        control.cancel(CancelReason::Shutdown);
        assert_eq!(control.cancel_reason(), Some(CancelReason::MemoryLimit));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let control = WorkerControl::new();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        control.cancel(CancelReason::Operator);
        assert_eq!(handle.await.expect("join"), CancelReason::Operator);
    }

    #[tokio::test]
    async fn test_wait_while_paused() {
        let control = WorkerControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        control.resume();
        assert!(handle.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pause() {
        let control = WorkerControl::new();
        control.pause();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.wait_while_paused().await });
        control.cancel(CancelReason::Shutdown);
        assert!(matches!(
            handle.await.expect("join"),
            Err(AgentError::Cancelled(CancelReason::Shutdown))
        ));
    }
}
