//! Shared fixtures: throwaway repositories and scripted agents.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use ralph_conductor::governor::GovernorConfig;
use ralph_conductor::locks::LockSet;
use ralph_conductor::{AgentError, AgentLoop, CoordinatorConfig, FileEdit, Goal, WorkspaceContext};

/// Run git in `dir` and return its trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repository on branch `main` with one commit.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.email", "conductor@example.com"]);
    git(dir, &["config", "user.name", "Conductor Tests"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    fs::write(dir.join("README.md"), "# test\n").expect("write readme");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

/// Worker branches left behind in the repository.
pub fn goal_branches(dir: &Path) -> Vec<String> {
    git(dir, &["branch", "--list", "ralph/goal/*", "--format=%(refname:short)"])
        .lines()
        .map(str::to_string)
        .collect()
}

/// One thing a scripted agent does.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Write(&'static str, &'static str),
    Fail(&'static str),
    /// Stop pulsing the heartbeat forever.
    Hang,
    /// Lock a path and never release it.
    LeakLock(&'static str),
    /// Lock a path until the agent returns.
    HoldLock(&'static str),
    /// Checkpoint `n` times, 25ms apart.
    Work(u32),
}

/// Runs a fixed list of steps per goal. Goals without a script write
/// `<goal id>.txt`.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: HashMap<String, Vec<Step>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, goal_id: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(goal_id.to_string(), steps);
        self
    }
}

#[async_trait]
impl AgentLoop for ScriptedAgent {
    async fn execute_goal(
        &self,
        goal: &Goal,
        ctx: &WorkspaceContext,
    ) -> Result<Vec<FileEdit>, AgentError> {
        let Some(steps) = self.scripts.get(&goal.id) else {
            let edit = ctx
                .write_file(&format!("{}.txt", goal.id), goal.title.as_bytes())
                .await?;
            return Ok(vec![edit]);
        };

        let mut edits = Vec::new();
        let mut held: Vec<LockSet> = Vec::new();
        for step in steps {
            match *step {
                Step::Write(path, contents) => {
                    edits.push(ctx.write_file(path, contents.as_bytes()).await?);
                }
                Step::Fail(message) => return Err(AgentError::Failed(message.to_string())),
                Step::Hang => {
                    ctx.checkpoint().await?;
                    std::future::pending::<()>().await;
                }
                Step::LeakLock(path) => {
                    let set = ctx.lock([path]).await?;
                    std::mem::forget(set);
                }
                Step::HoldLock(path) => held.push(ctx.lock([path]).await?),
                Step::Work(ticks) => {
                    for _ in 0..ticks {
                        ctx.checkpoint().await?;
                        tokio::time::sleep(Duration::from_millis(25)).await;
                    }
                }
            }
        }
        drop(held);
        Ok(edits)
    }
}

/// Coordinator settings tuned for tests: fast polling, no memory watchdog.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_governor(
            GovernorConfig::default()
                .with_slot_wait(Duration::from_millis(50))
                .with_memory_ceiling_mb(0),
        )
}

/// Poll `check` every 10ms until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
