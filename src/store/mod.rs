//! Object-store port.
//!
//! The admission core does not talk to a real control plane; it consumes a
//! stream of watch events and emits object mutations through this port.
//! Admission and eviction writes are conditional on the resource version the
//! decision was computed against. An in-memory implementation backs tests and
//! the standalone binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{
    Admission, ClusterQueue, ClusterQueueStatus, Condition, ConditionKind, LocalQueue,
    ResourceFlavor, Workload,
};
use crate::WorkloadUid;

/// Capacity of the watch fan-out channel.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Added,
    Modified,
    Deleted,
}

/// One observed object mutation. Delivery is at-least-once; handlers must be
/// idempotent.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    ClusterQueue(EventAction, ClusterQueue),
    ResourceFlavor(EventAction, ResourceFlavor),
    LocalQueue(EventAction, LocalQueue),
    Workload(EventAction, Workload),
    Job(EventAction, JobObject),
}

/// A concrete framework job, opaque to the core until an adapter translates
/// it into a Workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobObject {
    pub framework: String,
    pub name: String,
    pub namespace: String,
    pub uid: Uuid,
    pub creation_timestamp: DateTime<Utc>,
    /// LocalQueue the job was submitted through, if any.
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub suspended: bool,
    /// Framework-specific payload interpreted by the adapter.
    pub payload: serde_json::Value,
}

/// Why an admitted Workload was sent back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Preempted,
    AdmissionExpired,
    ClusterQueueStopped,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Preempted => "Preempted",
            EvictionReason::AdmissionExpired => "AdmissionExpired",
            EvictionReason::ClusterQueueStopped => "ClusterQueueStopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Admitted,
    Preempted,
    QuotaExceeded,
    AdmissionExpired,
}

/// Outbound event record (admission, preemption, quota-exceeded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub workload: String,
    pub namespace: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("write conflict on {object}: expected version {expected}, found {found}")]
    Conflict {
        object: String,
        expected: u64,
        found: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal store error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Conflicts mean the decision is stale and must not be replayed; other
    /// failures are worth a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Internal(_))
    }
}

/// Port to the external object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Record an admission on a Workload, conditional on its version.
    async fn admit_workload(
        &self,
        uid: WorkloadUid,
        admission: Admission,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Clear a Workload's admission and mark it evicted, conditional on its
    /// version.
    async fn evict_workload(
        &self,
        uid: WorkloadUid,
        reason: EvictionReason,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Create a Workload object (used by job adapters).
    async fn create_workload(&self, workload: Workload) -> Result<(), StoreError>;

    /// Set a condition on a Workload unconditionally.
    async fn set_workload_condition(
        &self,
        uid: WorkloadUid,
        condition: Condition,
    ) -> Result<(), StoreError>;

    /// Write a ClusterQueue's derived status.
    async fn update_cluster_queue_status(
        &self,
        name: &str,
        status: ClusterQueueStatus,
    ) -> Result<(), StoreError>;

    /// Emit an event record.
    async fn record_event(&self, event: EventRecord) -> Result<(), StoreError>;

    /// Subscribe to the watch stream.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Retry a store write with exponential backoff. Conflicts are surfaced
/// immediately; the caller's decision is stale and a replay would be wrong.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    attempts: u32,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut backoff = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                attempt += 1;
                warn!(
                    "store write {} failed (attempt {}/{}): {}",
                    operation, attempt, attempts, err
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Token bucket pacing outbound store traffic (clientConnection qps/burst).
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            state: Mutex::new(LimiterState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.qps))
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

/// In-memory object store used by tests and the standalone binary.
pub struct InMemoryStore {
    inner: Mutex<StoreState>,
    watch_tx: broadcast::Sender<WatchEvent>,
}

#[derive(Default)]
struct StoreState {
    workloads: HashMap<WorkloadUid, Workload>,
    cluster_queues: HashMap<String, ClusterQueue>,
    flavors: HashMap<String, ResourceFlavor>,
    local_queues: HashMap<(String, String), LocalQueue>,
    events: Vec<EventRecord>,
    version_counter: u64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(StoreState::default()),
            watch_tx,
        }
    }

    fn broadcast(&self, event: WatchEvent) {
        // Nobody listening is fine; late subscribers re-sync from state
        let _ = self.watch_tx.send(event);
    }

    /// Create or update a ClusterQueue, as if applied by an administrator.
    pub fn apply_cluster_queue(&self, cluster_queue: ClusterQueue) {
        let (event, cq) = {
            let mut state = self.inner.lock();
            state.version_counter += 1;
            let existed = state.cluster_queues.contains_key(&cluster_queue.name);
            state
                .cluster_queues
                .insert(cluster_queue.name.clone(), cluster_queue.clone());
            let action = if existed {
                EventAction::Modified
            } else {
                EventAction::Added
            };
            (action, cluster_queue)
        };
        self.broadcast(WatchEvent::ClusterQueue(event, cq));
    }

    pub fn delete_cluster_queue(&self, name: &str) {
        let removed = self.inner.lock().cluster_queues.remove(name);
        if let Some(cq) = removed {
            self.broadcast(WatchEvent::ClusterQueue(EventAction::Deleted, cq));
        }
    }

    pub fn apply_flavor(&self, flavor: ResourceFlavor) {
        let existed = {
            let mut state = self.inner.lock();
            state
                .flavors
                .insert(flavor.name.clone(), flavor.clone())
                .is_some()
        };
        let action = if existed {
            EventAction::Modified
        } else {
            EventAction::Added
        };
        self.broadcast(WatchEvent::ResourceFlavor(action, flavor));
    }

    pub fn delete_flavor(&self, name: &str) {
        let removed = self.inner.lock().flavors.remove(name);
        if let Some(flavor) = removed {
            self.broadcast(WatchEvent::ResourceFlavor(EventAction::Deleted, flavor));
        }
    }

    pub fn apply_local_queue(&self, local_queue: LocalQueue) {
        let key = (local_queue.namespace.clone(), local_queue.name.clone());
        let existed = {
            let mut state = self.inner.lock();
            state.local_queues.insert(key, local_queue.clone()).is_some()
        };
        let action = if existed {
            EventAction::Modified
        } else {
            EventAction::Added
        };
        self.broadcast(WatchEvent::LocalQueue(action, local_queue));
    }

    pub fn delete_local_queue(&self, namespace: &str, name: &str) {
        let removed = self
            .inner
            .lock()
            .local_queues
            .remove(&(namespace.to_string(), name.to_string()));
        if let Some(lq) = removed {
            self.broadcast(WatchEvent::LocalQueue(EventAction::Deleted, lq));
        }
    }

    /// Submit a Workload, as if created by a user.
    pub fn apply_workload(&self, mut workload: Workload) {
        let action = {
            let mut state = self.inner.lock();
            state.version_counter += 1;
            workload.metadata.resource_version = state.version_counter;
            let existed = state.workloads.contains_key(&workload.metadata.uid);
            state
                .workloads
                .insert(workload.metadata.uid, workload.clone());
            if existed {
                EventAction::Modified
            } else {
                EventAction::Added
            }
        };
        self.broadcast(WatchEvent::Workload(action, workload));
    }

    pub fn delete_workload(&self, uid: WorkloadUid) {
        let removed = self.inner.lock().workloads.remove(&uid);
        if let Some(workload) = removed {
            self.broadcast(WatchEvent::Workload(EventAction::Deleted, workload));
        }
    }

    /// Mark a Workload finished, as reported by its job adapter.
    pub fn finish_workload(&self, uid: WorkloadUid) {
        let updated = {
            let mut state = self.inner.lock();
            state.version_counter += 1;
            let version = state.version_counter;
            state.workloads.get_mut(&uid).map(|workload| {
                workload.metadata.resource_version = version;
                workload.set_condition(Condition::new(
                    ConditionKind::Finished,
                    true,
                    "JobFinished",
                ));
                workload.clone()
            })
        };
        if let Some(workload) = updated {
            self.broadcast(WatchEvent::Workload(EventAction::Modified, workload));
        }
    }

    pub fn apply_job(&self, job: JobObject) {
        self.broadcast(WatchEvent::Job(EventAction::Added, job));
    }

    pub fn get_workload(&self, uid: WorkloadUid) -> Option<Workload> {
        self.inner.lock().workloads.get(&uid).cloned()
    }

    pub fn get_cluster_queue(&self, name: &str) -> Option<ClusterQueue> {
        self.inner.lock().cluster_queues.get(name).cloned()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.inner.lock().events.clone()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn admit_workload(
        &self,
        uid: WorkloadUid,
        admission: Admission,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let updated = {
            let mut state = self.inner.lock();
            state.version_counter += 1;
            let version = state.version_counter;
            let workload = state
                .workloads
                .get_mut(&uid)
                .ok_or_else(|| StoreError::NotFound(uid.to_string()))?;
            if workload.metadata.resource_version != expected_version {
                return Err(StoreError::Conflict {
                    object: workload.metadata.name.clone(),
                    expected: expected_version,
                    found: workload.metadata.resource_version,
                });
            }
            workload.metadata.resource_version = version;
            workload.status.admission = Some(admission);
            workload.set_condition(Condition::new(
                ConditionKind::QuotaReserved,
                true,
                "QuotaReserved",
            ));
            workload.set_condition(Condition::new(ConditionKind::Admitted, true, "Admitted"));
            workload.set_condition(Condition::new(
                ConditionKind::Evicted,
                false,
                "AdmissionGranted",
            ));
            workload.clone()
        };
        debug!("admitted workload {} in store", updated.metadata.name);
        self.broadcast(WatchEvent::Workload(EventAction::Modified, updated));
        Ok(())
    }

    async fn evict_workload(
        &self,
        uid: WorkloadUid,
        reason: EvictionReason,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let updated = {
            let mut state = self.inner.lock();
            state.version_counter += 1;
            let version = state.version_counter;
            let workload = state
                .workloads
                .get_mut(&uid)
                .ok_or_else(|| StoreError::NotFound(uid.to_string()))?;
            if workload.metadata.resource_version != expected_version {
                return Err(StoreError::Conflict {
                    object: workload.metadata.name.clone(),
                    expected: expected_version,
                    found: workload.metadata.resource_version,
                });
            }
            workload.metadata.resource_version = version;
            workload.status.admission = None;
            workload.set_condition(Condition::new(ConditionKind::Evicted, true, reason.as_str()));
            workload.set_condition(Condition::new(
                ConditionKind::Admitted,
                false,
                reason.as_str(),
            ));
            workload.set_condition(Condition::new(
                ConditionKind::QuotaReserved,
                false,
                reason.as_str(),
            ));
            workload.clone()
        };
        debug!(
            "evicted workload {} ({})",
            updated.metadata.name,
            reason.as_str()
        );
        self.broadcast(WatchEvent::Workload(EventAction::Modified, updated));
        Ok(())
    }

    async fn create_workload(&self, workload: Workload) -> Result<(), StoreError> {
        self.apply_workload(workload);
        Ok(())
    }

    async fn set_workload_condition(
        &self,
        uid: WorkloadUid,
        condition: Condition,
    ) -> Result<(), StoreError> {
        let updated = {
            let mut state = self.inner.lock();
            state.version_counter += 1;
            let version = state.version_counter;
            let workload = state
                .workloads
                .get_mut(&uid)
                .ok_or_else(|| StoreError::NotFound(uid.to_string()))?;
            workload.metadata.resource_version = version;
            workload.set_condition(condition);
            workload.clone()
        };
        self.broadcast(WatchEvent::Workload(EventAction::Modified, updated));
        Ok(())
    }

    async fn update_cluster_queue_status(
        &self,
        name: &str,
        status: ClusterQueueStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        let cluster_queue = state
            .cluster_queues
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        // Status-only writes are not re-broadcast; nothing downstream keys
        // off them and echoing would churn the handlers
        cluster_queue.status = status;
        Ok(())
    }

    async fn record_event(&self, event: EventRecord) -> Result<(), StoreError> {
        self.inner.lock().events.push(event);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ObjectMeta, WorkloadSpec, WorkloadStatus};

    fn workload(name: &str) -> Workload {
        Workload {
            metadata: ObjectMeta::new(name, "default"),
            spec: WorkloadSpec {
                queue_name: "lq".to_string(),
                priority: 0,
                pod_sets: vec![],
            },
            status: WorkloadStatus::default(),
        }
    }

    #[tokio::test]
    async fn conditional_admit_rejects_stale_version() {
        let store = InMemoryStore::new();
        let w = workload("w1");
        let uid = w.metadata.uid;
        store.apply_workload(w);

        let observed = store.get_workload(uid).unwrap();
        let admission = Admission {
            cluster_queue: "cq".to_string(),
            pod_set_flavors: vec![],
        };

        // A write bumps the version; the original version is now stale
        store
            .admit_workload(uid, admission.clone(), observed.metadata.resource_version)
            .await
            .unwrap();
        let err = store
            .admit_workload(uid, admission, observed.metadata.resource_version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn evict_clears_admission_and_sets_conditions() {
        let store = InMemoryStore::new();
        let w = workload("w1");
        let uid = w.metadata.uid;
        store.apply_workload(w);

        let version = store.get_workload(uid).unwrap().metadata.resource_version;
        store
            .admit_workload(
                uid,
                Admission {
                    cluster_queue: "cq".to_string(),
                    pod_set_flavors: vec![],
                },
                version,
            )
            .await
            .unwrap();

        let version = store.get_workload(uid).unwrap().metadata.resource_version;
        store
            .evict_workload(uid, EvictionReason::Preempted, version)
            .await
            .unwrap();

        let evicted = store.get_workload(uid).unwrap();
        assert!(evicted.status.admission.is_none());
        assert!(evicted.has_condition(ConditionKind::Evicted));
        assert!(!evicted.has_condition(ConditionKind::Admitted));
    }

    #[tokio::test]
    async fn watch_delivers_applied_objects() {
        let store = InMemoryStore::new();
        let mut rx = store.watch();

        store.apply_flavor(ResourceFlavor::new("default"));
        match rx.recv().await.unwrap() {
            WatchEvent::ResourceFlavor(EventAction::Added, flavor) => {
                assert_eq!(flavor.name, "default");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(1000.0, 5);
        // Burst tokens are immediately available
        for _ in 0..5 {
            limiter.acquire().await;
        }
    }
}
