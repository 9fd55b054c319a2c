//! Layered configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults (`ConductorConfig::default()`),
//! 2. `.ralph/conductor.toml` in the project, or the file passed with
//!    `--config` (which must then exist),
//! 3. environment variables prefixed `RALPH_CONDUCTOR__`, with `__`
//!    separating sections, e.g. `RALPH_CONDUCTOR__WORKERS__MAX_WORKERS=8`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConductorResult;
use crate::git::MergeStrategy;
use crate::governor::GovernorConfig;
use crate::layout::StateLayout;
use crate::timeout::TimeoutConfig;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "RALPH_CONDUCTOR";

/// Worker and resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: usize,
    pub max_inference: usize,
    pub slot_wait_ms: u64,
    /// 0 disables the memory watchdog.
    pub max_memory_mb_per_worker: u64,
    pub memory_poll_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let governor = GovernorConfig::default();
        Self {
            max_workers: governor.max_workers,
            max_inference: governor.max_inference,
            slot_wait_ms: governor.slot_wait.as_millis() as u64,
            max_memory_mb_per_worker: governor.max_memory_mb_per_worker,
            memory_poll_interval_ms: governor.memory_poll_interval.as_millis() as u64,
        }
    }
}

/// Time budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub goal_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats_threshold: u32,
    pub startup_grace_secs: u64,
    pub git_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let timeouts = TimeoutConfig::default();
        Self {
            goal_timeout_secs: timeouts.goal_timeout.as_secs(),
            heartbeat_interval_secs: timeouts.heartbeat_interval.as_secs(),
            missed_heartbeats_threshold: timeouts.missed_heartbeats_threshold,
            startup_grace_secs: timeouts.startup_grace_period.as_secs(),
            git_timeout_secs: timeouts.git_timeout.as_secs(),
            poll_interval_ms: 500,
        }
    }
}

/// File lock behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub lock_timeout_secs: u64,
    /// Extra attempts after a lock timeout before the goal fails.
    pub retry_budget: u32,
    pub breadcrumbs: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lock_timeout_secs: TimeoutConfig::default().lock_timeout.as_secs(),
            retry_budget: 3,
            breadcrumbs: true,
        }
    }
}

/// Git integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Integration branch; defaults to whatever is checked out.
    pub base_branch: Option<String>,
    pub branch_prefix: String,
    pub merge_strategy: MergeStrategy,
    /// Delete worker branches once merged.
    pub cleanup_branches: bool,
    pub require_clean: bool,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: None,
            branch_prefix: "ralph/goal".to_string(),
            merge_strategy: MergeStrategy::default(),
            cleanup_branches: true,
            require_clean: true,
            author_name: None,
            author_email: None,
        }
    }
}

/// External agent command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Lock the goal's declared paths for the whole agent run.
    pub lock_declared_paths: Option<bool>,
}

/// Event journal and status persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub journal: bool,
    /// Days to keep run journals; 0 keeps them forever.
    pub retention_days: u64,
    pub persist_status: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            journal: true,
            retention_days: crate::events::journal::DEFAULT_RETENTION_DAYS,
            persist_status: true,
        }
    }
}

/// Complete conductor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub workers: WorkerSettings,
    pub timeouts: TimeoutSettings,
    pub locks: LockSettings,
    pub git: GitSettings,
    pub agent: AgentSettings,
    pub events: EventSettings,
}

impl ConductorConfig {
    /// Load configuration for the project at `project_root`.
    pub fn load(project_root: &Path, explicit: Option<&Path>) -> ConductorResult<Self> {
        let mut builder = config::Config::builder();
        builder = match explicit {
            Some(path) => builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            ),
            None => builder.add_source(
                config::File::from(StateLayout::new(project_root).config_file())
                    .format(config::FileFormat::Toml)
                    .required(false),
            ),
        };
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: ConductorConfig = builder.build()?.try_deserialize()?;
        tracing::debug!(
            max_workers = loaded.workers.max_workers,
            max_inference = loaded.workers.max_inference,
            "Loaded conductor configuration"
        );
        Ok(loaded)
    }

    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            max_workers: self.workers.max_workers,
            max_inference: self.workers.max_inference,
            slot_wait: Duration::from_millis(self.workers.slot_wait_ms),
            max_memory_mb_per_worker: self.workers.max_memory_mb_per_worker,
            memory_poll_interval: Duration::from_millis(self.workers.memory_poll_interval_ms),
        }
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            goal_timeout: Duration::from_secs(self.timeouts.goal_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.timeouts.heartbeat_interval_secs),
            missed_heartbeats_threshold: self.timeouts.missed_heartbeats_threshold,
            startup_grace_period: Duration::from_secs(self.timeouts.startup_grace_secs),
            lock_timeout: Duration::from_secs(self.locks.lock_timeout_secs),
            git_timeout: Duration::from_secs(self.timeouts.git_timeout_secs),
        }
    }
}
