//! Advisory file locks shared by all workers of one coordinator.
//!
//! Locks are exclusive, held in memory for the lifetime of the coordinator
//! process and keyed by normalized project-relative path. Batch acquisition
//! always proceeds in lexicographic path order, so holders that request
//! overlapping sets cannot deadlock. When a breadcrumb directory is
//! configured, every held lock also leaves a small JSON file on disk so that
//! a crashed run can be diagnosed and cleaned up by the next one.

pub mod breadcrumb;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::goal::normalize_path;

pub use breadcrumb::{BreadcrumbDir, LockBreadcrumb};

/// Errors raised by the lock manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock could not be acquired before the deadline.
    #[error("timed out after {waited:?} waiting for lock on '{path}' (held by {held_by})")]
    Timeout {
        path: String,
        holder: String,
        held_by: String,
        waited: Duration,
    },
}

/// Lock modes. Only exclusive locks exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
}

/// A held lock on one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLock {
    pub path: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub mode: LockMode,
    #[serde(skip)]
    token: u64,
}

#[derive(Debug)]
struct LockEntry {
    holder: String,
    token: u64,
    depth: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
    released: Notify,
    next_token: AtomicU64,
    breadcrumbs: Option<BreadcrumbDir>,
}

/// Deadlock-safe exclusive lock manager. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    inner: Arc<LockTable>,
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLockManager {
    /// Purely in-memory lock manager.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Lock manager that mirrors held locks into `breadcrumbs`.
    pub fn with_breadcrumbs(breadcrumbs: BreadcrumbDir) -> Self {
        Self::build(Some(breadcrumbs))
    }

    fn build(breadcrumbs: Option<BreadcrumbDir>) -> Self {
        Self {
            inner: Arc::new(LockTable {
                entries: Mutex::new(HashMap::new()),
                released: Notify::new(),
                next_token: AtomicU64::new(1),
                breadcrumbs,
            }),
        }
    }

    /// Acquire an exclusive lock on `path`, waiting at most `timeout`.
    ///
    /// Re-acquiring a path already held by the same holder succeeds
    /// immediately; each acquisition must be matched by a release.
    pub async fn acquire(
        &self,
        holder: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<FileLock, LockError> {
        let key = normalize_path(path);
        self.acquire_until(holder, &key, Instant::now() + timeout, timeout)
            .await
    }

    /// Acquire locks on every path, in lexicographic order, under one shared
    /// deadline. On timeout every lock taken by this call is released before
    /// the error is returned.
    pub async fn acquire_all<I, S>(
        &self,
        holder: &str,
        paths: I,
        timeout: Duration,
    ) -> Result<Vec<FileLock>, LockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<String> = paths
            .into_iter()
            .map(|path| normalize_path(path.as_ref()))
            .collect();
        keys.sort();
        keys.dedup();

        let deadline = Instant::now() + timeout;
        let mut acquired = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.acquire_until(holder, key, deadline, timeout).await {
                Ok(lock) => acquired.push(lock),
                Err(err) => {
                    for lock in acquired.iter().rev() {
                        self.release(lock);
                    }
                    return Err(err);
                }
            }
        }
        Ok(acquired)
    }

    /// Like [`FileLockManager::acquire_all`], returning a guard that releases
    /// the locks when dropped.
    pub async fn acquire_set<I, S>(
        &self,
        holder: &str,
        paths: I,
        timeout: Duration,
    ) -> Result<LockSet, LockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let locks = self.acquire_all(holder, paths, timeout).await?;
        Ok(LockSet {
            manager: self.clone(),
            locks,
        })
    }

    /// Release a lock. Returns false if the lock was already released or was
    /// force-released and taken by someone else since.
    pub fn release(&self, lock: &FileLock) -> bool {
        let removed = {
            let mut entries = self.entries();
            match entries.get_mut(&lock.path) {
                Some(entry) if entry.token == lock.token => {
                    entry.depth = entry.depth.saturating_sub(1);
                    if entry.depth == 0 {
                        entries.remove(&lock.path);
                        self.remove_breadcrumb(&lock.path);
                        Some(true)
                    } else {
                        Some(false)
                    }
                }
                _ => None,
            }
        };

        match removed {
            Some(true) => {
                self.inner.released.notify_waiters();
                tracing::trace!(path = %lock.path, holder = %lock.holder_id, "Released file lock");
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Drop every lock owned by `holder`, regardless of depth. Used when a
    /// worker exits or is force-cancelled.
    pub fn force_release_holder(&self, holder: &str) -> usize {
        let released: Vec<String> = {
            let mut entries = self.entries();
            let paths: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.holder == holder)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                entries.remove(path);
                self.remove_breadcrumb(path);
            }
            paths
        };

        if !released.is_empty() {
            self.inner.released.notify_waiters();
            tracing::debug!(holder, count = released.len(), "Force-released file locks");
        }
        released.len()
    }

    /// Number of paths currently locked.
    pub fn live_lock_count(&self) -> usize {
        self.entries().len()
    }

    /// Current holder of `path`, if any.
    pub fn holder_of(&self, path: &str) -> Option<String> {
        self.entries()
            .get(&normalize_path(path))
            .map(|entry| entry.holder.clone())
    }

    /// Paths currently held by `holder`, sorted.
    pub fn held_by(&self, holder: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.holder == holder)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Every live lock as (path, holder), sorted by path.
    pub fn holders(&self) -> Vec<(String, String)> {
        let mut holders: Vec<(String, String)> = self
            .entries()
            .iter()
            .map(|(path, entry)| (path.clone(), entry.holder.clone()))
            .collect();
        holders.sort();
        holders
    }

    /// Remove breadcrumbs left behind by a previous process.
    pub fn recover_stale(&self) -> Vec<LockBreadcrumb> {
        match self.inner.breadcrumbs.as_ref() {
            Some(dir) => match dir.recover_stale() {
                Ok(recovered) => recovered,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to scan lock breadcrumbs");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    async fn acquire_until(
        &self,
        holder: &str,
        key: &str,
        deadline: Instant,
        requested: Duration,
    ) -> Result<FileLock, LockError> {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take(holder, key) {
                Ok(lock) => return Ok(lock),
                Err(held_by) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::debug!(
                            path = key,
                            holder,
                            held_by = %held_by,
                            "Timed out waiting for file lock"
                        );
                        return Err(LockError::Timeout {
                            path: key.to_string(),
                            holder: holder.to_string(),
                            held_by,
                            waited: requested,
                        });
                    }
                }
            }
        }
    }

    /// Take the lock if it is free or already ours; otherwise return the
    /// current holder.
    fn try_take(&self, holder: &str, key: &str) -> Result<FileLock, String> {
        let (lock, fresh) = {
            let mut entries = self.entries();
            match entries.get_mut(key) {
                Some(entry) if entry.holder == holder => {
                    entry.depth += 1;
                    (
                        FileLock {
                            path: key.to_string(),
                            holder_id: holder.to_string(),
                            acquired_at: entry.acquired_at,
                            mode: LockMode::Exclusive,
                            token: entry.token,
                        },
                        false,
                    )
                }
                Some(entry) => return Err(entry.holder.clone()),
                None => {
                    let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                    let acquired_at = Utc::now();
                    self.write_breadcrumb(key, holder, acquired_at);
                    entries.insert(
                        key.to_string(),
                        LockEntry {
                            holder: holder.to_string(),
                            token,
                            depth: 1,
                            acquired_at,
                        },
                    );
                    (
                        FileLock {
                            path: key.to_string(),
                            holder_id: holder.to_string(),
                            acquired_at,
                            mode: LockMode::Exclusive,
                            token,
                        },
                        true,
                    )
                }
            }
        };

        if fresh {
            tracing::trace!(path = %lock.path, holder, "Acquired file lock");
        }
        Ok(lock)
    }

    // Breadcrumb files are keyed by path: write and remove them only while
    // the entry table is locked so they always mirror the table.
    fn write_breadcrumb(&self, path: &str, holder: &str, acquired_at: DateTime<Utc>) {
        if let Some(dir) = self.inner.breadcrumbs.as_ref() {
            let crumb = LockBreadcrumb::current(path, holder, acquired_at);
            if let Err(err) = dir.write(&crumb) {
                tracing::warn!(path, error = %err, "Failed to write lock breadcrumb");
            }
        }
    }

    fn remove_breadcrumb(&self, path: &str) {
        if let Some(dir) = self.inner.breadcrumbs.as_ref() {
            if let Err(err) = dir.remove(path) {
                tracing::warn!(path, error = %err, "Failed to remove lock breadcrumb");
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Locks released together when dropped.
#[derive(Debug)]
pub struct LockSet {
    manager: FileLockManager,
    locks: Vec<FileLock>,
}

impl LockSet {
    /// Locked paths in acquisition order.
    pub fn paths(&self) -> Vec<&str> {
        self.locks.iter().map(|lock| lock.path.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Release now instead of at drop.
    pub fn release(self) {}
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for lock in self.locks.iter().rev() {
            self.manager.release(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = FileLockManager::new();
        let lock = manager.acquire("w1", "src/a.rs", SHORT).await.expect("lock");

        assert_eq!(lock.path, "src/a.rs");
        assert_eq!(lock.holder_id, "w1");
        assert_eq!(lock.mode, LockMode::Exclusive);
        assert_eq!(manager.live_lock_count(), 1);
        assert_eq!(manager.holder_of("./src/a.rs"), Some("w1".to_string()));

        assert!(manager.release(&lock));
        assert_eq!(manager.live_lock_count(), 0);
        assert!(!manager.release(&lock));
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let manager = FileLockManager::new();
        let _lock = manager.acquire("w1", "a.txt", SHORT).await.expect("lock");

        let err = manager
            .acquire("w2", "a.txt", SHORT)
            .await
            .expect_err("contended");
        assert_eq!(
            err,
            LockError::Timeout {
                path: "a.txt".to_string(),
                holder: "w2".to_string(),
                held_by: "w1".to_string(),
                waited: SHORT,
            }
        );
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let manager = FileLockManager::new();
        let lock = manager.acquire("w1", "a.txt", SHORT).await.expect("lock");

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("w2", "a.txt", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release(&lock);

        let acquired = waiter.await.expect("join").expect("lock after release");
        assert_eq!(acquired.holder_id, "w2");
    }

    #[tokio::test]
    async fn test_reentrant_for_same_holder() {
        let manager = FileLockManager::new();
        let first = manager.acquire("w1", "a.txt", SHORT).await.expect("lock");
        let second = manager.acquire("w1", "a.txt", SHORT).await.expect("relock");

        manager.release(&second);
        assert_eq!(manager.live_lock_count(), 1);
        manager.release(&first);
        assert_eq!(manager.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_all_sorts_and_dedups() {
        let manager = FileLockManager::new();
        let locks = manager
            .acquire_all("w1", ["src/b.rs", "src/a.rs", "./src/b.rs"], SHORT)
            .await
            .expect("locks");
        let paths: Vec<&str> = locks.iter().map(|lock| lock.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.rs", "src/b.rs"]);
    }

    #[tokio::test]
    async fn test_acquire_all_releases_partial_on_timeout() {
        let manager = FileLockManager::new();
        let _blocker = manager.acquire("w2", "c.txt", SHORT).await.expect("lock");

        let err = manager
            .acquire_all("w1", ["a.txt", "b.txt", "c.txt"], SHORT)
            .await
            .expect_err("c.txt is held");
        assert!(matches!(err, LockError::Timeout { ref path, .. } if path == "c.txt"));
        assert!(manager.held_by("w1").is_empty());
        assert_eq!(manager.live_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_permuted_acquire_all_does_not_deadlock() {
        let manager = FileLockManager::new();
        let orders: Vec<Vec<&'static str>> = vec![
            vec!["a", "b", "c", "d"],
            vec!["d", "c", "b", "a"],
            vec!["b", "d", "a", "c"],
            vec!["c", "a", "d", "b"],
            vec!["d", "a", "c", "b"],
            vec!["a", "c", "b", "d"],
        ];

        let mut handles = Vec::new();
        for (index, order) in orders.into_iter().enumerate() {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let holder = format!("w{}", index);
                for _ in 0..5 {
                    let locks = manager
                        .acquire_all(&holder, order.clone(), Duration::from_secs(10))
                        .await?;
                    tokio::task::yield_now().await;
                    for lock in &locks {
                        manager.release(lock);
                    }
                }
                Ok::<_, LockError>(())
            }));
        }

        let results = tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(handles),
        )
        .await
        .expect("no deadlock");
        for result in results {
            result.expect("join").expect("every holder completes");
        }
        assert_eq!(manager.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_force_release_holder() {
        let manager = FileLockManager::new();
        let _a = manager
            .acquire_all("w1", ["a.txt", "b.txt"], SHORT)
            .await
            .expect("locks");
        let _other = manager.acquire("w2", "c.txt", SHORT).await.expect("lock");

        assert_eq!(
            manager.holders(),
            vec![
                ("a.txt".to_string(), "w1".to_string()),
                ("b.txt".to_string(), "w1".to_string()),
                ("c.txt".to_string(), "w2".to_string()),
            ]
        );
        assert_eq!(manager.force_release_holder("w1"), 2);
        assert_eq!(manager.live_lock_count(), 1);
        assert_eq!(manager.holder_of("c.txt"), Some("w2".to_string()));
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_release_reacquired_lock() {
        let manager = FileLockManager::new();
        let stale = manager.acquire("w1", "a.txt", SHORT).await.expect("lock");
        manager.force_release_holder("w1");
        let _fresh = manager.acquire("w2", "a.txt", SHORT).await.expect("lock");

        assert!(!manager.release(&stale));
        assert_eq!(manager.holder_of("a.txt"), Some("w2".to_string()));
    }

    #[tokio::test]
    async fn test_lock_set_releases_on_drop() {
        let manager = FileLockManager::new();
        {
            let set = manager
                .acquire_set("w1", ["a.txt", "b.txt"], SHORT)
                .await
                .expect("locks");
            assert_eq!(set.paths(), vec!["a.txt", "b.txt"]);
            assert_eq!(manager.live_lock_count(), 2);
        }
        assert_eq!(manager.live_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_breadcrumbs_follow_lock_lifetime() {
        let temp_dir = TempDir::new().expect("temp dir");
        let dir = BreadcrumbDir::new(temp_dir.path().join("locks")).expect("dir");
        let manager = FileLockManager::with_breadcrumbs(dir.clone());

        let lock = manager.acquire("w1", "src/a.rs", SHORT).await.expect("lock");
        let crumb_path = dir.file_for("src/a.rs");
        assert!(crumb_path.exists());

        manager.release(&lock);
        assert!(!crumb_path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_breadcrumbs_track_holders_under_contention() {
        let temp_dir = TempDir::new().expect("temp dir");
        let dir = BreadcrumbDir::new(temp_dir.path().join("locks")).expect("dir");
        let manager = FileLockManager::with_breadcrumbs(dir.clone());

        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let manager = manager.clone();
                let dir = dir.clone();
                tokio::spawn(async move {
                    let holder = format!("worker-{}", n);
                    for round in 0..40 {
                        let lock = manager
                            .acquire(&holder, "shared.txt", Duration::from_secs(10))
                            .await
                            .expect("lock");
                        let crumbs = dir.list().expect("list");
                        assert_eq!(crumbs.len(), 1, "breadcrumbs: {:?}", crumbs);
                        assert_eq!(crumbs[0].holder, holder);
                        if round % 2 == 0 {
                            manager.release(&lock);
                        } else {
                            manager.force_release_holder(&holder);
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for joined in futures::future::join_all(tasks).await {
            joined.expect("task");
        }

        assert_eq!(manager.live_lock_count(), 0);
        assert!(dir.list().expect("list").is_empty());
    }
}
