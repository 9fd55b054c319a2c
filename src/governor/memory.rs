//! Per-worker memory ceiling.
//!
//! Workers register the OS processes they start (the agent command, for
//! instance). A background task samples resident memory of each registered
//! process and its descendants; a worker above the ceiling is reported once
//! through a channel so the coordinator can cancel it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const MAX_ANCESTRY_DEPTH: usize = 32;

/// A worker that crossed the memory ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBreach {
    pub worker_id: String,
    pub resident_mb: u64,
    pub ceiling_mb: u64,
}

/// Samples memory of registered worker processes.
#[derive(Debug, Clone)]
pub struct MemoryWatchdog {
    ceiling_mb: u64,
    poll_interval: Duration,
    tracked: Arc<Mutex<HashMap<String, Vec<u32>>>>,
}

impl MemoryWatchdog {
    pub fn new(ceiling_mb: u64, poll_interval: Duration) -> Self {
        Self {
            ceiling_mb,
            poll_interval,
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ceiling_mb(&self) -> u64 {
        self.ceiling_mb
    }

    /// Start watching `pid` on behalf of `worker_id`.
    pub fn track(&self, worker_id: &str, pid: u32) {
        self.tracked()
            .entry(worker_id.to_string())
            .or_default()
            .push(pid);
        tracing::debug!(worker_id, pid, "Tracking worker process memory");
    }

    /// Stop watching every process of `worker_id`.
    pub fn untrack(&self, worker_id: &str) {
        self.tracked().remove(worker_id);
    }

    pub fn tracked_workers(&self) -> usize {
        self.tracked().len()
    }

    /// Spawn the sampling loop. It runs until `stop` flips to true or the
    /// receiving end of `breaches` is dropped.
    pub fn spawn(
        &self,
        breaches: mpsc::Sender<MemoryBreach>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut system = System::new();
            let mut interval = tokio::time::interval(watchdog.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                for breach in watchdog.sample(&mut system) {
                    tracing::warn!(
                        worker_id = %breach.worker_id,
                        resident_mb = breach.resident_mb,
                        ceiling_mb = breach.ceiling_mb,
                        "Worker exceeded memory ceiling"
                    );
                    // Report each worker once.
                    watchdog.untrack(&breach.worker_id);
                    if breaches.send(breach).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Resident memory in MiB per tracked worker, including descendants.
    pub fn resident_mb(&self, system: &mut System) -> HashMap<String, u64> {
        let tracked = self.tracked().clone();
        if tracked.is_empty() {
            return HashMap::new();
        }
        system.refresh_processes(ProcessesToUpdate::All, true);

        let roots: HashMap<Pid, String> = tracked
            .iter()
            .flat_map(|(worker, pids)| {
                pids.iter()
                    .map(move |pid| (Pid::from_u32(*pid), worker.clone()))
            })
            .collect();

        let mut bytes: HashMap<String, u64> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(worker) = owning_worker(system, *pid, &roots) {
                *bytes.entry(worker).or_default() += process.memory();
            }
        }
        bytes
            .into_iter()
            .map(|(worker, total)| (worker, total / 1024 / 1024))
            .collect()
    }

    fn sample(&self, system: &mut System) -> Vec<MemoryBreach> {
        if self.ceiling_mb == 0 {
            return Vec::new();
        }
        let mut breaches: Vec<MemoryBreach> = self
            .resident_mb(system)
            .into_iter()
            .filter(|(_, resident)| *resident > self.ceiling_mb)
            .map(|(worker_id, resident_mb)| MemoryBreach {
                worker_id,
                resident_mb,
                ceiling_mb: self.ceiling_mb,
            })
            .collect();
        breaches.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        breaches
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<String, Vec<u32>>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Walk up the parent chain of `pid` looking for a tracked root.
fn owning_worker(system: &System, pid: Pid, roots: &HashMap<Pid, String>) -> Option<String> {
    let mut current = Some(pid);
    let mut seen = HashSet::new();
    for _ in 0..MAX_ANCESTRY_DEPTH {
        let pid = current?;
        if let Some(worker) = roots.get(&pid) {
            return Some(worker.clone());
        }
        if !seen.insert(pid) {
            return None;
        }
        current = system.process(pid).and_then(|process| process.parent());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_untrack() {
        let watchdog = MemoryWatchdog::new(100, Duration::from_millis(10));
        watchdog.track("worker-1", 1);
        watchdog.track("worker-1", 2);
        watchdog.track("worker-2", 3);
        assert_eq!(watchdog.tracked_workers(), 2);

        watchdog.untrack("worker-1");
        assert_eq!(watchdog.tracked_workers(), 1);
    }

    #[test]
    fn test_own_process_memory_is_measured() {
        let watchdog = MemoryWatchdog::new(1, Duration::from_millis(10));
        watchdog.track("self", std::process::id());
        let mut system = System::new();

        let usage = watchdog.resident_mb(&mut system);
        assert!(usage.contains_key("self"));
    }

    #[test]
    fn test_zero_ceiling_never_breaches() {
        let watchdog = MemoryWatchdog::new(0, Duration::from_millis(10));
        watchdog.track("self", std::process::id());
        let mut system = System::new();
        assert!(watchdog.sample(&mut system).is_empty());
    }

    #[tokio::test]
    async fn test_breach_is_reported_once() {
        // The test process itself uses far more than 0 MiB; a 1 MiB ceiling
        // is always exceeded.
        let watchdog = MemoryWatchdog::new(1, Duration::from_millis(10));
        watchdog.track("self", std::process::id());
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = watchdog.spawn(tx, stop_rx);
        let breach = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("breach reported")
            .expect("channel open");
        assert_eq!(breach.worker_id, "self");
        assert_eq!(breach.ceiling_mb, 1);
        assert_eq!(watchdog.tracked_workers(), 0);

        let _ = stop_tx.send(true);
        handle.await.expect("watchdog stops");
    }
}
