//! Priority ordering for pending Workloads.
//!
//! Key = (−priority, creation time, uid): higher priority pops first, ties
//! go to the older workload, equal timestamps break on uid so the order is
//! total and stable.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::Workload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey {
    priority: i32,
    created: DateTime<Utc>,
    uid: Uuid,
}

impl From<&Workload> for QueueKey {
    fn from(workload: &Workload) -> Self {
        Self {
            priority: workload.priority(),
            created: workload.metadata.creation_timestamp,
            uid: workload.metadata.uid,
        }
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smallest key pops first
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created.cmp(&other.created))
            .then_with(|| self.uid.cmp(&other.uid))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered set of pending Workloads for one ClusterQueue.
///
/// Backed by an ordered map rather than a binary heap: the scheduler walks
/// successors in order (best-effort FIFO) and removes arbitrary entries on
/// admission or deletion, both of which a heap does poorly.
#[derive(Debug, Default)]
pub struct PendingHeap {
    entries: BTreeMap<QueueKey, Arc<Workload>>,
    keys: HashMap<Uuid, QueueKey>,
}

impl PendingHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uid: Uuid) -> bool {
        self.keys.contains_key(&uid)
    }

    /// Insert or re-key a workload. A priority change re-queues it at its
    /// new position; creation time (and thus FIFO standing) is preserved.
    pub fn push(&mut self, workload: Arc<Workload>) {
        let uid = workload.metadata.uid;
        if let Some(old_key) = self.keys.remove(&uid) {
            self.entries.remove(&old_key);
        }
        let key = QueueKey::from(workload.as_ref());
        self.keys.insert(uid, key.clone());
        self.entries.insert(key, workload);
    }

    pub fn remove(&mut self, uid: Uuid) -> Option<Arc<Workload>> {
        let key = self.keys.remove(&uid)?;
        self.entries.remove(&key)
    }

    /// Best workload without removing it.
    pub fn peek(&self) -> Option<&Arc<Workload>> {
        self.entries.values().next()
    }

    /// All pending workloads in pop order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Workload>> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> Vec<Arc<Workload>> {
        self.keys.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ObjectMeta, WorkloadSpec, WorkloadStatus};
    use chrono::Duration;

    fn workload(name: &str, priority: i32, age_secs: i64) -> Arc<Workload> {
        let mut metadata = ObjectMeta::new(name, "default");
        metadata.creation_timestamp = Utc::now() - Duration::seconds(age_secs);
        Arc::new(Workload {
            metadata,
            spec: WorkloadSpec {
                queue_name: "lq".to_string(),
                priority,
                pod_sets: vec![],
            },
            status: WorkloadStatus::default(),
        })
    }

    fn order(heap: &PendingHeap) -> Vec<String> {
        heap.iter().map(|w| w.metadata.name.clone()).collect()
    }

    #[test]
    fn higher_priority_pops_first() {
        let mut heap = PendingHeap::new();
        heap.push(workload("low", 1, 100));
        heap.push(workload("high", 5, 10));
        assert_eq!(order(&heap), vec!["high", "low"]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut heap = PendingHeap::new();
        heap.push(workload("newer", 3, 10));
        heap.push(workload("older", 3, 100));
        assert_eq!(order(&heap), vec!["older", "newer"]);
    }

    #[test]
    fn priority_change_requeues() {
        let mut heap = PendingHeap::new();
        let w = workload("w", 1, 100);
        heap.push(w.clone());
        heap.push(workload("other", 3, 10));
        assert_eq!(heap.peek().unwrap().metadata.name, "other");

        let mut bumped = (*w).clone();
        bumped.spec.priority = 10;
        heap.push(Arc::new(bumped));
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.peek().unwrap().metadata.name, "w");
    }

    #[test]
    fn remove_by_uid() {
        let mut heap = PendingHeap::new();
        let w = workload("w", 1, 100);
        heap.push(w.clone());
        assert!(heap.remove(w.metadata.uid).is_some());
        assert!(heap.is_empty());
        assert!(heap.remove(w.metadata.uid).is_none());
    }
}
