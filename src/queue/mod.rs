//! Pending-workload queues.
//!
//! One priority heap per ClusterQueue, aggregating submissions from every
//! LocalQueue that points at it. The scheduler reads per-cycle candidate
//! lists through [`QueueManager::heads`]; strategy semantics (strict vs
//! best-effort head-of-line blocking) are enforced by the cycle, ordering by
//! the heap.

pub mod heap;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::api::{ClusterQueue, LabelSelector, LocalQueue, QueueingStrategy, Workload};
use crate::WorkloadUid;
use heap::PendingHeap;

/// Implicit label every namespace carries, used to evaluate namespace
/// selectors without a namespace object stream.
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

struct CqQueue {
    name: String,
    strategy: QueueingStrategy,
    /// None ⇒ no namespace may submit; empty ⇒ all may.
    namespace_selector: RwLock<Option<LabelSelector>>,
    heap: Mutex<PendingHeap>,
}

#[derive(Default)]
struct RoutingState {
    /// (namespace, local queue name) → cluster queue name.
    local_queues: HashMap<(String, String), String>,
    /// Pending workloads with no resolvable queue yet.
    unrouted: HashMap<WorkloadUid, Arc<Workload>>,
    /// Which heap each routed pending workload sits in.
    locations: HashMap<WorkloadUid, String>,
}

/// A per-cycle view of one ClusterQueue's candidates.
pub struct CqHeads {
    pub cluster_queue: String,
    pub strategy: QueueingStrategy,
    pub candidates: Vec<HeadCandidate>,
}

pub struct HeadCandidate {
    pub workload: Arc<Workload>,
    /// Whether the workload's namespace matches the queue's selector. An
    /// ineligible workload stays queued but cannot be admitted, so a later
    /// selector change picks it up again.
    pub namespace_eligible: bool,
}

#[derive(Default)]
pub struct QueueManager {
    queues: RwLock<HashMap<String, Arc<CqQueue>>>,
    routing: Mutex<RoutingState>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a ClusterQueue. The heap and the captured
    /// queueing strategy survive updates.
    pub fn add_cluster_queue(&self, cluster_queue: &ClusterQueue) {
        {
            let mut queues = self.queues.write();
            match queues.get(&cluster_queue.name) {
                Some(existing) => {
                    *existing.namespace_selector.write() =
                        cluster_queue.spec.namespace_selector.clone();
                }
                None => {
                    queues.insert(
                        cluster_queue.name.clone(),
                        Arc::new(CqQueue {
                            name: cluster_queue.name.clone(),
                            strategy: cluster_queue.spec.queueing_strategy,
                            namespace_selector: RwLock::new(
                                cluster_queue.spec.namespace_selector.clone(),
                            ),
                            heap: Mutex::new(PendingHeap::new()),
                        }),
                    );
                }
            }
        }
        self.route_unrouted();
    }

    /// Drop a ClusterQueue; its pending workloads park until a queue for
    /// them reappears.
    pub fn delete_cluster_queue(&self, name: &str) {
        let removed = self.queues.write().remove(name);
        if let Some(queue) = removed {
            let orphans = queue.heap.lock().drain();
            let mut routing = self.routing.lock();
            for workload in orphans {
                routing.locations.remove(&workload.metadata.uid);
                routing.unrouted.insert(workload.metadata.uid, workload);
            }
            debug!("cluster queue {} removed from queue manager", name);
        }
    }

    pub fn add_local_queue(&self, local_queue: &LocalQueue) {
        {
            let mut routing = self.routing.lock();
            routing.local_queues.insert(
                (local_queue.namespace.clone(), local_queue.name.clone()),
                local_queue.cluster_queue.clone(),
            );
        }
        self.route_unrouted();
    }

    /// Remove a LocalQueue and move its pending workloads out of their heap;
    /// they re-route if an equivalent queue appears later.
    pub fn delete_local_queue(&self, namespace: &str, name: &str) {
        let target = {
            let mut routing = self.routing.lock();
            routing
                .local_queues
                .remove(&(namespace.to_string(), name.to_string()))
        };
        let Some(cq_name) = target else { return };

        let queue = self.queues.read().get(&cq_name).cloned();
        if let Some(queue) = queue {
            let moved: Vec<Arc<Workload>> = {
                let mut heap = queue.heap.lock();
                let uids: Vec<WorkloadUid> = heap
                    .iter()
                    .filter(|w| {
                        w.metadata.namespace == namespace && w.spec.queue_name == name
                    })
                    .map(|w| w.metadata.uid)
                    .collect();
                uids.into_iter().filter_map(|uid| heap.remove(uid)).collect()
            };
            let mut routing = self.routing.lock();
            for workload in moved {
                routing.locations.remove(&workload.metadata.uid);
                routing.unrouted.insert(workload.metadata.uid, workload);
            }
        }
    }

    /// Track a Workload. Pending workloads are routed to their heap;
    /// admitted or finished ones leave the queues.
    pub fn add_or_update_workload(&self, workload: &Workload) {
        let uid = workload.uid();
        if workload.is_admitted() || workload.is_finished() {
            self.delete_workload(uid);
            return;
        }
        self.place(Arc::new(workload.clone()));
    }

    pub fn delete_workload(&self, uid: WorkloadUid) {
        let mut routing = self.routing.lock();
        routing.unrouted.remove(&uid);
        if let Some(cq_name) = routing.locations.remove(&uid) {
            drop(routing);
            if let Some(queue) = self.queues.read().get(&cq_name).cloned() {
                queue.heap.lock().remove(uid);
            }
        }
    }

    /// Number of pending workloads charged to a ClusterQueue.
    pub fn pending_count(&self, cq_name: &str) -> u32 {
        self.queues
            .read()
            .get(cq_name)
            .map(|q| q.heap.lock().len() as u32)
            .unwrap_or(0)
    }

    /// Candidates for one scheduling cycle: every queue's pending workloads
    /// in heap order, queues rotated by cycle number for fairness.
    pub fn heads(&self, cycle: u64) -> Vec<CqHeads> {
        let queues: Vec<Arc<CqQueue>> = {
            let map = self.queues.read();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            if !names.is_empty() {
                let offset = (cycle % names.len() as u64) as usize;
                names.rotate_left(offset);
            }
            names.into_iter().filter_map(|n| map.get(n).cloned()).collect()
        };

        queues
            .into_iter()
            .map(|queue| {
                let selector = queue.namespace_selector.read().clone();
                let candidates = queue
                    .heap
                    .lock()
                    .iter()
                    .map(|workload| HeadCandidate {
                        namespace_eligible: namespace_eligible(
                            &selector,
                            &workload.metadata.namespace,
                        ),
                        workload: workload.clone(),
                    })
                    .collect();
                CqHeads {
                    cluster_queue: queue.name.clone(),
                    strategy: queue.strategy,
                    candidates,
                }
            })
            .collect()
    }

    fn place(&self, workload: Arc<Workload>) {
        let uid = workload.metadata.uid;
        let key = (
            workload.metadata.namespace.clone(),
            workload.spec.queue_name.clone(),
        );

        let (previous, target) = {
            let mut routing = self.routing.lock();
            let target = routing.local_queues.get(&key).cloned();
            let previous = routing.locations.remove(&uid);
            routing.unrouted.remove(&uid);
            match &target {
                Some(cq_name) => {
                    routing.locations.insert(uid, cq_name.clone());
                }
                None => {
                    routing.unrouted.insert(uid, workload.clone());
                }
            }
            (previous, target)
        };

        if let Some(previous_cq) = previous {
            if target.as_deref() != Some(previous_cq.as_str()) {
                if let Some(queue) = self.queues.read().get(&previous_cq).cloned() {
                    queue.heap.lock().remove(uid);
                }
            }
        }

        if let Some(cq_name) = target {
            match self.queues.read().get(&cq_name).cloned() {
                Some(queue) => {
                    queue.heap.lock().push(workload);
                }
                None => {
                    // LocalQueue points at a queue we have not seen yet
                    let mut routing = self.routing.lock();
                    routing.locations.remove(&uid);
                    routing.unrouted.insert(uid, workload);
                }
            }
        } else {
            debug!(
                "workload {} waits for local queue {}/{}",
                uid, key.0, key.1
            );
        }
    }

    /// Retry placement of parked workloads after queue topology changes.
    fn route_unrouted(&self) {
        let parked: Vec<Arc<Workload>> = {
            let mut routing = self.routing.lock();
            routing.unrouted.drain().map(|(_, w)| w).collect()
        };
        for workload in parked {
            self.place(workload);
        }
    }
}

fn namespace_eligible(selector: &Option<LabelSelector>, namespace: &str) -> bool {
    match selector {
        None => false,
        Some(selector) => {
            let labels = HashMap::from([(
                NAMESPACE_NAME_LABEL.to_string(),
                namespace.to_string(),
            )]);
            selector.matches(&labels)
        }
    }
}
