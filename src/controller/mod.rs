//! Event handling edge of the core.
//!
//! Applies the object store's watch stream to the Cache and Queue Manager
//! (idempotently, the stream is at-least-once), translates framework jobs
//! through the adapter registry, and publishes derived ClusterQueue status.

use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::adapters::AdapterRegistry;
use crate::api::{ClusterQueueStatus, Condition, ConditionKind};
use crate::cache::Cache;
use crate::config::Config;
use crate::queue::QueueManager;
use crate::store::{with_retry, EventAction, JobObject, ObjectStore, RateLimiter, WatchEvent};

/// Publishes ClusterQueue status derived from the cache and queues.
pub struct StatusReporter {
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    store: Arc<dyn ObjectStore>,
    limiter: Arc<RateLimiter>,
}

impl StatusReporter {
    pub fn new(
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        store: Arc<dyn ObjectStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            cache,
            queues,
            store,
            limiter,
        }
    }

    /// Recompute and write status for the given queues. The written usage
    /// always equals a recomputation from the admitted workload set.
    pub async fn sync(&self, cq_names: &[String]) {
        for name in cq_names {
            let Some((active, reason)) = self.cache.active_reason(name) else {
                continue;
            };
            let status = ClusterQueueStatus {
                flavors_usage: self.cache.flavors_usage(name),
                pending_workloads: self.queues.pending_count(name),
                admitted_workloads: self.cache.admitted_count(name),
                conditions: vec![Condition::new(ConditionKind::Active, active, reason)],
            };

            self.limiter.acquire().await;
            let result = with_retry("cluster queue status", 3, || {
                let status = status.clone();
                async move { self.store.update_cluster_queue_status(name, status).await }
            })
            .await;
            if let Err(err) = result {
                warn!("could not publish status of cluster queue {}: {}", name, err);
            }
        }
    }
}

pub struct Controller {
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    store: Arc<dyn ObjectStore>,
    adapters: AdapterRegistry,
    reporter: Arc<StatusReporter>,
    wake: Arc<Notify>,
    manage_jobs_without_queue_name: bool,
}

impl Controller {
    pub fn new(
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        store: Arc<dyn ObjectStore>,
        reporter: Arc<StatusReporter>,
        wake: Arc<Notify>,
        config: &Config,
    ) -> Self {
        Self {
            cache,
            queues,
            store,
            adapters: AdapterRegistry::from_config(&config.integrations),
            reporter,
            wake,
            manage_jobs_without_queue_name: config.manage_jobs_without_queue_name,
        }
    }

    /// Consume the watch stream until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut watch = self.store.watch();
        info!("controller started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = watch.recv() => match event {
                    Ok(event) => self.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("watch stream lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        info!("controller stopped");
    }

    /// Apply one observed mutation. Safe to replay.
    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::ResourceFlavor(action, flavor) => match action {
                EventAction::Added | EventAction::Modified => self.cache.upsert_flavor(flavor),
                EventAction::Deleted => self.cache.delete_flavor(&flavor.name),
            },
            WatchEvent::ClusterQueue(action, cluster_queue) => {
                match action {
                    EventAction::Added | EventAction::Modified => {
                        if let Err(err) = self.cache.upsert_cluster_queue(&cluster_queue) {
                            warn!("rejected cluster queue configuration: {}", err);
                        }
                        self.queues.add_cluster_queue(&cluster_queue);
                    }
                    EventAction::Deleted => {
                        self.cache.delete_cluster_queue(&cluster_queue.name);
                        self.queues.delete_cluster_queue(&cluster_queue.name);
                    }
                }
                self.reporter.sync(&[cluster_queue.name.clone()]).await;
            }
            WatchEvent::LocalQueue(action, local_queue) => match action {
                EventAction::Added | EventAction::Modified => {
                    self.queues.add_local_queue(&local_queue)
                }
                EventAction::Deleted => self
                    .queues
                    .delete_local_queue(&local_queue.namespace, &local_queue.name),
            },
            WatchEvent::Workload(action, workload) => {
                let affected = match action {
                    EventAction::Added | EventAction::Modified => {
                        let affected = self.cache.add_or_update_workload(&workload);
                        self.queues.add_or_update_workload(&workload);
                        affected
                    }
                    EventAction::Deleted => {
                        self.queues.delete_workload(workload.uid());
                        self.cache.delete_workload(workload.uid())
                    }
                };
                self.reporter.sync(&affected).await;
            }
            WatchEvent::Job(action, job) => self.handle_job(action, job).await,
        }
        self.wake.notify_one();
    }

    async fn handle_job(&self, action: EventAction, job: JobObject) {
        if job.queue_name.is_none() && !self.manage_jobs_without_queue_name {
            debug!("ignoring job {} without a queue name", job.name);
            return;
        }
        let Some(adapter) = self.adapters.get(&job.framework) else {
            warn!("no adapter enabled for framework {}", job.framework);
            return;
        };

        match action {
            EventAction::Added => {
                if !adapter.is_suspended(&job) {
                    debug!("job {} is already running; not managed", job.name);
                    return;
                }
                match adapter.build_workload(&job) {
                    Ok(workload) => {
                        if let Err(err) = self.store.create_workload(workload).await {
                            warn!("could not create workload for job {}: {}", job.name, err);
                        }
                    }
                    Err(err) => warn!("could not translate job {}: {}", job.name, err),
                }
            }
            EventAction::Modified => {
                // Relay the readiness signal onto the workload; the adapter
                // gave the workload the job's uid
                let ready = adapter.pods_ready(&job);
                self.cache.set_pods_ready(job.uid, ready);
                if ready {
                    if let Err(err) = self
                        .store
                        .set_workload_condition(
                            job.uid,
                            Condition::new(ConditionKind::PodsReady, true, "PodsReady"),
                        )
                        .await
                    {
                        debug!("could not set readiness of job {}: {}", job.name, err);
                    }
                }
            }
            EventAction::Deleted => {
                debug!("job {} deleted; its workload follows via garbage collection", job.name);
            }
        }
    }
}
