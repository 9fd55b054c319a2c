//! Resource governor: bounded worker and inference concurrency.
//!
//! Two independent semaphore pools cap how many workers run at once and how
//! many language-model calls are in flight across all workers. Slots are RAII
//! guards; a worker that dies without releasing still frees its slot when its
//! task is dropped. Per-worker memory is policed separately by
//! [`memory::MemoryWatchdog`].

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub use memory::{MemoryBreach, MemoryWatchdog};

/// Errors raised while waiting for a slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    /// No slot became free within the bounded wait. The caller should defer
    /// and retry.
    #[error("no {pool} slot available after {waited:?}")]
    Exhausted { pool: &'static str, waited: Duration },

    /// The wait was cancelled.
    #[error("wait for {pool} slot cancelled")]
    Cancelled { pool: &'static str },

    /// The pool was closed.
    #[error("{pool} pool closed")]
    Closed { pool: &'static str },
}

/// Which pool a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPool {
    Worker,
    Inference,
}

impl SlotPool {
    pub fn as_label(&self) -> &'static str {
        match self {
            SlotPool::Worker => "worker",
            SlotPool::Inference => "inference",
        }
    }
}

/// Limits enforced by the governor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Maximum concurrently running workers.
    /// Default: 4
    pub max_workers: usize,
    /// Maximum concurrent inference calls across all workers.
    /// Default: 2
    pub max_inference: usize,
    /// Longest single wait for a slot before reporting exhaustion.
    /// Default: 5 seconds
    pub slot_wait: Duration,
    /// Resident memory ceiling per worker in MiB; 0 disables the watchdog.
    /// Default: 2048
    pub max_memory_mb_per_worker: u64,
    /// How often the memory watchdog samples worker processes.
    /// Default: 2 seconds
    pub memory_poll_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_inference: 2,
            slot_wait: Duration::from_secs(5),
            max_memory_mb_per_worker: 2048,
            memory_poll_interval: Duration::from_secs(2),
        }
    }
}

impl GovernorConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_max_inference(mut self, max_inference: usize) -> Self {
        self.max_inference = max_inference;
        self
    }

    pub fn with_slot_wait(mut self, slot_wait: Duration) -> Self {
        self.slot_wait = slot_wait;
        self
    }

    pub fn with_memory_ceiling_mb(mut self, megabytes: u64) -> Self {
        self.max_memory_mb_per_worker = megabytes;
        self
    }
}

/// In-use/total counts for both pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub workers_in_use: usize,
    pub workers_total: usize,
    pub inference_in_use: usize,
    pub inference_total: usize,
}

/// A held slot. Dropping it returns the slot to its pool.
#[derive(Debug)]
pub struct Slot {
    pool: SlotPool,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn pool(&self) -> SlotPool {
        self.pool
    }

    /// Return the slot now instead of at drop.
    pub fn release(self) {}
}

/// Shared governor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    config: GovernorConfig,
    worker_slots: Arc<Semaphore>,
    inference_slots: Arc<Semaphore>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let workers = config.max_workers.max(1);
        let inference = config.max_inference.max(1);
        Self {
            worker_slots: Arc::new(Semaphore::new(workers)),
            inference_slots: Arc::new(Semaphore::new(inference)),
            config: GovernorConfig {
                max_workers: workers,
                max_inference: inference,
                ..config
            },
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Wait for a worker slot until `cancelled` resolves or the bounded wait
    /// expires.
    pub async fn acquire_worker_slot<F>(&self, cancelled: F) -> Result<Slot, GovernorError>
    where
        F: Future<Output = ()>,
    {
        self.acquire(SlotPool::Worker, cancelled).await
    }

    /// Wait for an inference slot until `cancelled` resolves or the bounded
    /// wait expires.
    pub async fn acquire_inference_slot<F>(&self, cancelled: F) -> Result<Slot, GovernorError>
    where
        F: Future<Output = ()>,
    {
        self.acquire(SlotPool::Inference, cancelled).await
    }

    /// Take a worker slot only if one is free right now.
    pub fn try_acquire_worker_slot(&self) -> Option<Slot> {
        self.worker_slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot {
                pool: SlotPool::Worker,
                _permit: permit,
            })
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            workers_in_use: self
                .config
                .max_workers
                .saturating_sub(self.worker_slots.available_permits()),
            workers_total: self.config.max_workers,
            inference_in_use: self
                .config
                .max_inference
                .saturating_sub(self.inference_slots.available_permits()),
            inference_total: self.config.max_inference,
        }
    }

    /// Worker count suggested for this machine: the configured maximum,
    /// capped by available CPUs.
    pub fn recommended_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.config.max_workers.min(cpus).max(1)
    }

    async fn acquire<F>(&self, pool: SlotPool, cancelled: F) -> Result<Slot, GovernorError>
    where
        F: Future<Output = ()>,
    {
        let semaphore = match pool {
            SlotPool::Worker => self.worker_slots.clone(),
            SlotPool::Inference => self.inference_slots.clone(),
        };
        let wait = self.config.slot_wait;

        tokio::select! {
            biased;
            _ = cancelled => Err(GovernorError::Cancelled { pool: pool.as_label() }),
            acquired = tokio::time::timeout(wait, semaphore.acquire_owned()) => match acquired {
                Ok(Ok(permit)) => Ok(Slot { pool, _permit: permit }),
                Ok(Err(_)) => Err(GovernorError::Closed { pool: pool.as_label() }),
                Err(_) => {
                    tracing::debug!(pool = pool.as_label(), waited_ms = wait.as_millis() as u64, "Slot pool exhausted");
                    Err(GovernorError::Exhausted { pool: pool.as_label(), waited: wait })
                }
            },
        }
    }
}
