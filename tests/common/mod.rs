//! Shared test harness: the full core wired against the in-memory store,
//! with watch events pumped by hand so every test step is deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;

use batchgate::api::{
    ClusterQueue, ClusterQueueSpec, Condition, ConditionKind, FlavorQuotas, LocalQueue,
    ObjectMeta, PodSet, Quantity, QueueingStrategy, ResourceFlavor, ResourceGroup,
    ResourceQuota, Workload, WorkloadSpec,
};
use batchgate::config::Config;
use batchgate::controller::{Controller, StatusReporter};
use batchgate::scheduler::{CycleOutcome, SchedulerTuning};
use batchgate::store::{InMemoryStore, ObjectStore, RateLimiter, WatchEvent};
use batchgate::{Cache, QueueManager, Scheduler, WorkloadUid};

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<Cache>,
    pub queues: Arc<QueueManager>,
    controller: Controller,
    scheduler: Scheduler,
    watch: broadcast::Receiver<WatchEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let watch = store.watch();
        let store_dyn: Arc<dyn ObjectStore> = store.clone();

        let cache = Arc::new(Cache::new());
        let queues = Arc::new(QueueManager::new());
        let limiter = Arc::new(RateLimiter::new(10_000.0, 10_000));
        let reporter = Arc::new(StatusReporter::new(
            cache.clone(),
            queues.clone(),
            store_dyn.clone(),
            limiter.clone(),
        ));
        let scheduler = Scheduler::new(
            cache.clone(),
            queues.clone(),
            store_dyn.clone(),
            reporter.clone(),
            limiter,
            SchedulerTuning::from_config(&config),
        );
        let controller = Controller::new(
            cache.clone(),
            queues.clone(),
            store_dyn,
            reporter,
            scheduler.wake_handle(),
            &config,
        );

        Self {
            store,
            cache,
            queues,
            controller,
            scheduler,
            watch,
        }
    }

    /// Apply every pending watch event through the controller.
    pub async fn drain(&mut self) {
        loop {
            match self.watch.try_recv() {
                Ok(event) => self.controller.handle(event).await,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    /// Sync observed state, run one scheduling cycle, then observe its
    /// writes back — exactly the loop the running service performs.
    pub async fn cycle(&mut self) -> CycleOutcome {
        self.drain().await;
        let outcome = self.scheduler.run_cycle().await;
        self.drain().await;
        outcome
    }

    /// Feed a single (possibly replayed) watch event through the handlers.
    pub async fn handle_event(&mut self, event: WatchEvent) {
        self.controller.handle(event).await;
    }

    /// Report an admitted workload's pods as ready.
    pub async fn set_pods_ready(&mut self, uid: WorkloadUid) {
        let store: Arc<dyn ObjectStore> = self.store.clone();
        store
            .set_workload_condition(
                uid,
                Condition::new(ConditionKind::PodsReady, true, "PodsReady"),
            )
            .await
            .expect("workload exists");
        self.drain().await;
    }
}

/// Single-group ClusterQueue: flavor `x` providing `cpu`.
pub fn cluster_queue(name: &str, cohort: Option<&str>, nominal_cpu: i64) -> ClusterQueue {
    ClusterQueue {
        name: name.to_string(),
        spec: ClusterQueueSpec {
            cohort: cohort.map(|c| c.to_string()),
            resource_groups: vec![ResourceGroup {
                covered_resources: vec!["cpu".to_string()],
                flavors: vec![FlavorQuotas {
                    name: "x".to_string(),
                    resources: vec![ResourceQuota {
                        name: "cpu".to_string(),
                        nominal_quota: Quantity::from_units(nominal_cpu),
                        borrowing_limit: None,
                    }],
                }],
            }],
            queueing_strategy: QueueingStrategy::BestEffortFifo,
            // Empty selector: every namespace may submit
            namespace_selector: Some(Default::default()),
            preemption: Default::default(),
        },
        status: Default::default(),
    }
}

pub fn flavor(name: &str) -> ResourceFlavor {
    ResourceFlavor::new(name)
}

pub fn local_queue(namespace: &str, name: &str, cq: &str) -> LocalQueue {
    LocalQueue {
        name: name.to_string(),
        namespace: namespace.to_string(),
        cluster_queue: cq.to_string(),
    }
}

/// Single-pod-set workload requesting `cpu` on one pod, created
/// `age_secs` ago so FIFO order is explicit.
pub fn workload(
    name: &str,
    namespace: &str,
    queue: &str,
    priority: i32,
    cpu: i64,
    age_secs: i64,
) -> Workload {
    let mut metadata = ObjectMeta::new(name, namespace);
    metadata.creation_timestamp = Utc::now() - Duration::seconds(age_secs);
    Workload {
        metadata,
        spec: WorkloadSpec {
            queue_name: queue.to_string(),
            priority,
            pod_sets: vec![PodSet {
                name: "main".to_string(),
                count: 1,
                requests: BTreeMap::from([("cpu".to_string(), Quantity::from_units(cpu))]),
                node_selector: Default::default(),
                tolerations: vec![],
            }],
        },
        status: Default::default(),
    }
}
