//! batchgate — admission control for batch workloads.
//!
//! Administrators declare quota buckets (ClusterQueues) grouped into borrowing
//! cohorts; users submit Workloads through namespaced LocalQueues. The core
//! decides, continuously, which pending Workloads are admitted, against which
//! quota flavor, and which admitted Workloads to preempt when room runs out.
//!
//! Architecture:
//! - `cache`: in-memory quota snapshot and usage arithmetic
//! - `queue`: per-ClusterQueue pending heaps with strict/best-effort FIFO
//! - `preemption`: minimal victim selection within a queue or across a cohort
//! - `scheduler`: the admission cycle tying the three together
//! - `store` / `controller` / `adapters`: the event-driven edge of the core

pub mod adapters;
pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod preemption;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use cache::Cache;
pub use preemption::PreemptionPlanner;
pub use queue::QueueManager;
pub use scheduler::Scheduler;

use uuid::Uuid;

/// Unique identifier of a Workload.
pub type WorkloadUid = Uuid;

/// Core error type for admission decisions and cache mutations.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid configuration for cluster queue {queue}: {reason}")]
    InvalidConfig { queue: String, reason: String },

    #[error("cluster queue not found: {0}")]
    ClusterQueueNotFound(String),

    #[error("workload {0} is already assumed")]
    AlreadyAssumed(WorkloadUid),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;
