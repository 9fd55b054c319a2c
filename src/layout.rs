//! On-disk state layout under `<project>/.ralph/`.
//!
//! ```text
//! .ralph/
//!   .gitignore            ignores the whole directory
//!   conductor.toml        optional configuration
//!   locks/                lock breadcrumbs
//!   worktrees/<goal>/     worker snapshots
//!   conductor/
//!     status.json         latest status snapshot
//!     control/            pause request flags
//!     runs/<run-id>/      event journal (events.jsonl, run.json)
//!     metrics/            run metrics
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const RALPH_DIR_NAME: &str = ".ralph";
const CONDUCTOR_DIR_NAME: &str = "conductor";
const CONFIG_FILE_NAME: &str = "conductor.toml";
const STATUS_FILE_NAME: &str = "status.json";

/// Paths of the conductor's state for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    project_root: PathBuf,
}

impl StateLayout {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(RALPH_DIR_NAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir().join(CONFIG_FILE_NAME)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir().join("worktrees")
    }

    pub fn conductor_dir(&self) -> PathBuf {
        self.state_dir().join(CONDUCTOR_DIR_NAME)
    }

    pub fn status_file(&self) -> PathBuf {
        self.conductor_dir().join(STATUS_FILE_NAME)
    }

    pub fn control_dir(&self) -> PathBuf {
        self.conductor_dir().join("control")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.conductor_dir().join("runs")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.conductor_dir().join("metrics")
    }

    /// Create the state directories. The state directory ignores itself so
    /// worktrees and journals never show up as changes in the project.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.locks_dir(),
            self.worktrees_dir(),
            self.control_dir(),
            self.metrics_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        let gitignore = self.state_dir().join(".gitignore");
        if !gitignore.exists() {
            fs::write(gitignore, "*\n")?;
        }
        Ok(())
    }
}
