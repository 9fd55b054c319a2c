//! On-disk breadcrumbs for held locks.
//!
//! Locks themselves never leave the coordinator's memory. The breadcrumb is
//! only evidence: if a coordinator dies while holding locks, the next one
//! finds the files, logs what was held by whom, and deletes them.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sysinfo::{Pid, ProcessesToUpdate, System};

const BREADCRUMB_EXTENSION: &str = "lock";

/// Contents of one breadcrumb file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockBreadcrumb {
    /// Normalized project-relative path that was locked.
    pub path: String,
    /// Worker that held the lock.
    pub holder: String,
    /// PID of the coordinator process.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

impl LockBreadcrumb {
    /// Breadcrumb for a lock held by the current process.
    pub fn current(path: &str, holder: &str, acquired_at: DateTime<Utc>) -> Self {
        Self {
            path: path.to_string(),
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at,
        }
    }

    /// Whether the owning coordinator is another process that is still alive.
    fn owned_by_live_peer(&self) -> bool {
        self.pid != std::process::id() && is_pid_alive(self.pid)
    }
}

/// Directory holding one breadcrumb file per locked path.
#[derive(Debug, Clone)]
pub struct BreadcrumbDir {
    dir: PathBuf,
}

impl BreadcrumbDir {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Breadcrumb file for a locked path: hex SHA-256 of the path.
    pub fn file_for(&self, path: &str) -> PathBuf {
        let digest = Sha256::digest(path.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), BREADCRUMB_EXTENSION))
    }

    pub fn write(&self, crumb: &LockBreadcrumb) -> io::Result<()> {
        let path = self.file_for(&crumb.path);
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(crumb).map_err(io::Error::other)?;
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        fs::rename(&temp_path, &path)
    }

    pub fn remove(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.file_for(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// All readable breadcrumbs in the directory.
    pub fn list(&self) -> io::Result<Vec<LockBreadcrumb>> {
        let mut crumbs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BREADCRUMB_EXTENSION) {
                continue;
            }
            if let Ok(crumb) = read_breadcrumb(&path) {
                crumbs.push(crumb);
            }
        }
        crumbs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(crumbs)
    }

    /// Delete breadcrumbs whose owner is gone and return them.
    ///
    /// Breadcrumbs owned by another live coordinator are left in place with a
    /// warning; unreadable files are deleted.
    pub fn recover_stale(&self) -> io::Result<Vec<LockBreadcrumb>> {
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BREADCRUMB_EXTENSION) {
                continue;
            }
            match read_breadcrumb(&path) {
                Ok(crumb) if crumb.owned_by_live_peer() => {
                    tracing::warn!(
                        pid = crumb.pid,
                        path = %crumb.path,
                        holder = %crumb.holder,
                        "Lock breadcrumb belongs to another running coordinator"
                    );
                }
                Ok(crumb) => {
                    tracing::warn!(
                        pid = crumb.pid,
                        path = %crumb.path,
                        holder = %crumb.holder,
                        acquired_at = %crumb.acquired_at,
                        "Recovering stale lock breadcrumb"
                    );
                    fs::remove_file(&path)?;
                    recovered.push(crumb);
                }
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "Removing unreadable lock breadcrumb");
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(recovered)
    }
}

fn read_breadcrumb(path: &Path) -> io::Result<LockBreadcrumb> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn is_pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
