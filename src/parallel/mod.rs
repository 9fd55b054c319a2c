//! Scheduling, running and merging goals.

pub mod dependency;
pub mod reconcile;
pub mod scheduler;
pub mod worker;
