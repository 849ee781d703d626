//! The admission cycle.
//!
//! A single cooperatively scheduled task: wake on cache or queue mutation
//! (bounded by a minimum backoff and a maximum idle interval), freeze a
//! snapshot, walk the pending heads in a fair interleaving, and commit
//! admissions or plan preemptions. Only one cycle runs at a time; every
//! decision is ordered against the snapshot it was computed from.

pub mod assignment;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::api::{QueueingStrategy, Workload};
use crate::cache::Cache;
use crate::config::Config;
use crate::controller::StatusReporter;
use crate::preemption::{PreemptionPlanner, Victim};
use crate::queue::{CqHeads, QueueManager};
use crate::store::{
    EventKind, EventRecord, EvictionReason, ObjectStore, RateLimiter, StoreError,
};
use crate::WorkloadUid;
use assignment::AssignmentOutcome;

/// Timing and gating knobs of the cycle.
#[derive(Debug, Clone)]
pub struct SchedulerTuning {
    /// Grace horizon for assumed admissions awaiting their observed event.
    pub assume_ttl: Duration,
    /// Minimum pause between cycles.
    pub min_backoff: Duration,
    /// Maximum idle interval before a cycle runs anyway.
    pub max_idle: Duration,
    /// Gate successor admissions in a queue on prior admissions reaching
    /// PodsReady.
    pub wait_for_pods_ready: bool,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            assume_ttl: Duration::from_secs(30),
            min_backoff: Duration::from_millis(50),
            max_idle: Duration::from_secs(60),
            wait_for_pods_ready: false,
        }
    }
}

impl SchedulerTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            assume_ttl: config.scheduler.assume_ttl(),
            min_backoff: config.scheduler.min_backoff(),
            max_idle: config.scheduler.max_idle(),
            wait_for_pods_ready: config.wait_for_pods_ready.enable,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub admitted: Vec<WorkloadUid>,
    pub preemptions: Vec<(WorkloadUid, Vec<Victim>)>,
    pub exhausted: Vec<WorkloadUid>,
    /// Queues whose derived status should be re-published.
    pub touched_queues: BTreeSet<String>,
}

struct Cursor {
    heads: CqHeads,
    position: usize,
    blocked: bool,
}

pub struct Scheduler {
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    store: Arc<dyn ObjectStore>,
    reporter: Arc<StatusReporter>,
    limiter: Arc<RateLimiter>,
    planner: PreemptionPlanner,
    tuning: SchedulerTuning,
    wake: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    cycle: u64,
}

impl Scheduler {
    pub fn new(
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        store: Arc<dyn ObjectStore>,
        reporter: Arc<StatusReporter>,
        limiter: Arc<RateLimiter>,
        tuning: SchedulerTuning,
    ) -> Self {
        Self {
            cache,
            queues,
            store,
            reporter,
            limiter,
            planner: PreemptionPlanner::new(),
            tuning,
            wake: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            cycle: 0,
        }
    }

    /// Handle for event handlers to nudge the cycle.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Drive cycles until shutdown. Cancellation takes effect at the next
    /// candidate boundary; committed admissions stand, nothing is half-done.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("scheduler started");

        let cancelled = self.cancelled.clone();
        let mut cancel_rx = shutdown.resubscribe();
        tokio::spawn(async move {
            let _ = cancel_rx.recv().await;
            cancelled.store(true, Ordering::SeqCst);
        });

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("scheduler stopping");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.tuning.max_idle) => {}
            }

            if self.cancelled.load(Ordering::SeqCst) {
                info!("scheduler stopping");
                break;
            }

            self.run_cycle().await;
            tokio::time::sleep(self.tuning.min_backoff).await;
        }
    }

    /// Execute one admission cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.cycle += 1;
        let mut outcome = CycleOutcome {
            cycle: self.cycle,
            ..Default::default()
        };

        // Assumed admissions whose write was never observed go back to
        // pending before the new snapshot is taken
        for (cq_name, workload) in self.cache.expire_assumed(Instant::now()) {
            outcome.touched_queues.insert(cq_name.clone());
            let _ = self
                .store
                .record_event(event(
                    EventKind::AdmissionExpired,
                    &workload,
                    format!("admission to {cq_name} was not observed in time"),
                ))
                .await;
            self.queues.add_or_update_workload(&workload);
        }

        let mut snapshot = self.cache.snapshot();
        let mut cursors: Vec<Cursor> = self
            .queues
            .heads(self.cycle)
            .into_iter()
            .map(|heads| Cursor {
                heads,
                position: 0,
                blocked: false,
            })
            .collect();
        let mut quota_events: BTreeSet<WorkloadUid> = BTreeSet::new();

        // Positional round-robin: first heads of every queue, then seconds,
        // and so on. A strict queue whose head is not admitted yields
        // nothing more this cycle.
        loop {
            let mut progressed = false;
            for index in 0..cursors.len() {
                if self.cancelled.load(Ordering::SeqCst) {
                    debug!("cycle {} aborted by shutdown", self.cycle);
                    return outcome;
                }

                let (cq_name, strict, candidate) = {
                    let cursor = &cursors[index];
                    if cursor.blocked || cursor.position >= cursor.heads.candidates.len() {
                        continue;
                    }
                    let candidate = &cursor.heads.candidates[cursor.position];
                    (
                        cursor.heads.cluster_queue.clone(),
                        matches!(cursor.heads.strategy, QueueingStrategy::StrictFifo),
                        (candidate.workload.clone(), candidate.namespace_eligible),
                    )
                };
                progressed = true;
                let (workload, namespace_eligible) = candidate;

                let (queue_active, pods_ready_gate) = match snapshot.cluster_queue(&cq_name) {
                    Some(cq) => (
                        cq.active,
                        self.tuning.wait_for_pods_ready && !cq.all_pods_ready,
                    ),
                    None => (false, false),
                };
                if !queue_active {
                    debug!("cluster queue {} is not active; skipping", cq_name);
                    cursors[index].blocked = true;
                    continue;
                }
                if pods_ready_gate {
                    debug!(
                        "cluster queue {} waits for pods of prior admissions; skipping",
                        cq_name
                    );
                    cursors[index].blocked = true;
                    continue;
                }
                if !namespace_eligible {
                    debug!(
                        "workload {} is not eligible for {} by namespace",
                        workload.metadata.name, cq_name
                    );
                    if strict {
                        cursors[index].blocked = true;
                    } else {
                        cursors[index].position += 1;
                    }
                    continue;
                }

                let admitted = self
                    .attempt(&mut snapshot, &cq_name, &workload, &mut quota_events, &mut outcome)
                    .await;

                if admitted {
                    cursors[index].position += 1;
                    // A fresh admission is by definition not pods-ready yet
                    if self.tuning.wait_for_pods_ready {
                        cursors[index].blocked = true;
                    }
                } else if strict {
                    cursors[index].blocked = true;
                } else {
                    cursors[index].position += 1;
                }
            }
            if !progressed {
                break;
            }
        }

        let touched: Vec<String> = outcome.touched_queues.iter().cloned().collect();
        if !touched.is_empty() {
            self.reporter.sync(&touched).await;
        }
        outcome
    }

    /// Try to admit one candidate against the cycle snapshot. Returns true
    /// on admission.
    async fn attempt(
        &self,
        snapshot: &mut crate::cache::snapshot::Snapshot,
        cq_name: &str,
        workload: &Arc<Workload>,
        quota_events: &mut BTreeSet<WorkloadUid>,
        outcome: &mut CycleOutcome,
    ) -> bool {
        let assignment = {
            let cq = match snapshot.cluster_queue(cq_name) {
                Some(cq) => cq,
                None => return false,
            };
            assignment::assign(snapshot, cq, workload)
        };

        match assignment {
            AssignmentOutcome::Fit(assignment) => {
                // Later candidates this cycle must see the consumed quota
                snapshot.add_usage(cq_name, &assignment.usage);
                if let Err(err) = self.cache.assume_workload(
                    workload,
                    &assignment.admission,
                    self.tuning.assume_ttl,
                ) {
                    warn!(
                        "could not assume workload {}: {}",
                        workload.metadata.name, err
                    );
                    snapshot.sub_usage(cq_name, &assignment.usage);
                    return false;
                }

                self.limiter.acquire().await;
                match self
                    .store
                    .admit_workload(
                        workload.uid(),
                        assignment.admission.clone(),
                        workload.metadata.resource_version,
                    )
                    .await
                {
                    Ok(()) => {
                        info!(
                            "admitted workload {} to cluster queue {}{}",
                            workload.metadata.name,
                            cq_name,
                            if assignment.borrows { " (borrowing)" } else { "" }
                        );
                        self.queues.delete_workload(workload.uid());
                        let _ = self
                            .store
                            .record_event(event(
                                EventKind::Admitted,
                                workload,
                                format!("admitted to cluster queue {cq_name}"),
                            ))
                            .await;
                        outcome.admitted.push(workload.uid());
                        outcome.touched_queues.insert(cq_name.to_string());
                        true
                    }
                    Err(StoreError::Conflict { .. }) => {
                        // The object moved under us; abandon this decision
                        // entirely and let the next cycle see fresh state
                        debug!(
                            "admission of workload {} went stale; abandoning",
                            workload.metadata.name
                        );
                        self.cache.forget_workload(workload.uid());
                        snapshot.sub_usage(cq_name, &assignment.usage);
                        false
                    }
                    Err(err) => {
                        warn!(
                            "admission write for workload {} failed: {}",
                            workload.metadata.name, err
                        );
                        self.cache.forget_workload(workload.uid());
                        snapshot.sub_usage(cq_name, &assignment.usage);
                        false
                    }
                }
            }
            AssignmentOutcome::NoFit { reason, .. } => {
                match self.planner.plan(snapshot, cq_name, workload) {
                    Some(victims) if !victims.is_empty() => {
                        info!(
                            "preempting {} workload(s) to make room for {} in {}",
                            victims.len(),
                            workload.metadata.name,
                            cq_name
                        );
                        for victim in &victims {
                            self.limiter.acquire().await;
                            match self
                                .store
                                .evict_workload(
                                    victim.uid,
                                    EvictionReason::Preempted,
                                    victim.resource_version,
                                )
                                .await
                            {
                                Ok(()) => {
                                    outcome.touched_queues.insert(victim.cluster_queue.clone());
                                    let _ = self
                                        .store
                                        .record_event(EventRecord {
                                            kind: EventKind::Preempted,
                                            workload: victim.name.clone(),
                                            namespace: victim.namespace.clone(),
                                            message: format!(
                                                "preempted to accommodate {}",
                                                workload.metadata.name
                                            ),
                                            timestamp: chrono::Utc::now(),
                                        })
                                        .await;
                                }
                                Err(err) => {
                                    // Victim changed since the snapshot; the
                                    // remaining plan is stale too
                                    warn!(
                                        "eviction of {} failed: {}; abandoning plan",
                                        victim.name, err
                                    );
                                    break;
                                }
                            }
                        }
                        // The pending workload stays queued and is
                        // reconsidered once the victims are observed gone
                        outcome.preemptions.push((workload.uid(), victims));
                        false
                    }
                    _ => {
                        if quota_events.insert(workload.uid()) {
                            let _ = self
                                .store
                                .record_event(event(
                                    EventKind::QuotaExceeded,
                                    workload,
                                    format!("cannot admit to {cq_name}: {reason}"),
                                ))
                                .await;
                        }
                        debug!(
                            "workload {} does not fit {}: {}",
                            workload.metadata.name, cq_name, reason
                        );
                        outcome.exhausted.push(workload.uid());
                        false
                    }
                }
            }
        }
    }
}

fn event(kind: EventKind, workload: &Workload, message: String) -> EventRecord {
    EventRecord {
        kind,
        workload: workload.metadata.name.clone(),
        namespace: workload.metadata.namespace.clone(),
        message,
        timestamp: chrono::Utc::now(),
    }
}
