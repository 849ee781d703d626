//! Preemption planning.
//!
//! Given a pending workload that does not fit, select a locally minimal set
//! of admitted victims whose removal makes it fit. Victims come from the
//! workload's own ClusterQueue (within-queue preemption) and/or from cohort
//! peers consuming above their nominal quota (reclaim), subject to the
//! queue's configured policies.

use tracing::debug;

use crate::api::{FlavorResource, Quantity, ReclaimWithinCohort, Workload, WithinClusterQueue};
use crate::cache::snapshot::Snapshot;
use crate::scheduler::assignment::{self, AssignmentOutcome};
use crate::WorkloadUid;

/// An admitted workload chosen for eviction.
#[derive(Debug, Clone)]
pub struct Victim {
    pub uid: WorkloadUid,
    pub name: String,
    pub namespace: String,
    pub cluster_queue: String,
    pub priority: i32,
    /// Version the eviction write must be conditional on.
    pub resource_version: u64,
}

#[derive(Debug, Clone)]
struct Candidate {
    victim: Victim,
    usage: crate::api::UsageMap,
    admitted_at: chrono::DateTime<chrono::Utc>,
    /// True for cohort-reclaim candidates, which may only be taken while
    /// their owning queue is above nominal on the contested coordinate.
    reclaim: bool,
}

#[derive(Debug, Default)]
pub struct PreemptionPlanner;

impl PreemptionPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan victims for `pending` against `cq_name`, or report infeasibility
    /// with `None`. The snapshot is not modified; selection runs against
    /// private clones.
    pub fn plan(
        &self,
        snapshot: &Snapshot,
        cq_name: &str,
        pending: &Workload,
    ) -> Option<Vec<Victim>> {
        let cq = snapshot.cluster_queue(cq_name)?;
        let policies = cq.preemption;

        if policies.within_cluster_queue == WithinClusterQueue::Never
            && policies.reclaim_within_cohort == ReclaimWithinCohort::Never
        {
            return None;
        }

        let candidates = self.collect_candidates(snapshot, cq_name, pending);
        if candidates.is_empty() {
            return None;
        }

        let selected = self.select_greedy(snapshot, cq_name, pending, candidates)?;
        let minimal = self.minimize(snapshot, cq_name, pending, selected);

        debug!(
            "planned {} victim(s) for workload {}",
            minimal.len(),
            pending.metadata.name
        );
        Some(minimal.into_iter().map(|c| c.victim).collect())
    }

    /// Candidates ordered by (priority ascending, admission time descending,
    /// uid): the least important, most recently admitted go first.
    fn collect_candidates(
        &self,
        snapshot: &Snapshot,
        cq_name: &str,
        pending: &Workload,
    ) -> Vec<Candidate> {
        let cq = match snapshot.cluster_queue(cq_name) {
            Some(cq) => cq,
            None => return Vec::new(),
        };
        let policies = cq.preemption;
        let mut candidates = Vec::new();

        if policies.within_cluster_queue == WithinClusterQueue::LowerPriority {
            for entry in cq.admitted.values() {
                if entry.priority < pending.priority() {
                    candidates.push(Candidate {
                        victim: Victim {
                            uid: entry.uid,
                            name: entry.name.clone(),
                            namespace: entry.namespace.clone(),
                            cluster_queue: cq_name.to_string(),
                            priority: entry.priority,
                            resource_version: entry.resource_version,
                        },
                        usage: entry.usage.clone(),
                        admitted_at: entry.admitted_at,
                        reclaim: false,
                    });
                }
            }
        }

        // Reclaim is only for workloads entitled to their queue's nominal
        // quota: if the pending workload needs to borrow, evicting peers
        // would not be reclaiming anything
        let reclaim_allowed = policies.reclaim_within_cohort != ReclaimWithinCohort::Never
            && assignment::fits_under_nominal(snapshot, cq, pending);

        if reclaim_allowed {
            if let Some(cohort) = cq.cohort.as_deref() {
                for peer in snapshot.cohort_members(cohort) {
                    if peer.name == cq_name {
                        continue;
                    }
                    for entry in peer.admitted.values() {
                        let priority_ok = match policies.reclaim_within_cohort {
                            ReclaimWithinCohort::Any => true,
                            ReclaimWithinCohort::LowerPriority => {
                                entry.priority < pending.priority()
                            }
                            ReclaimWithinCohort::Never => false,
                        };
                        if priority_ok {
                            candidates.push(Candidate {
                                victim: Victim {
                                    uid: entry.uid,
                                    name: entry.name.clone(),
                                    namespace: entry.namespace.clone(),
                                    cluster_queue: peer.name.clone(),
                                    priority: entry.priority,
                                    resource_version: entry.resource_version,
                                },
                                usage: entry.usage.clone(),
                                admitted_at: entry.admitted_at,
                                reclaim: true,
                            });
                        }
                    }
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.victim
                .priority
                .cmp(&b.victim.priority)
                .then_with(|| b.admitted_at.cmp(&a.admitted_at))
                .then_with(|| a.victim.uid.cmp(&b.victim.uid))
        });
        candidates
    }

    /// Greedily evict the first ordered candidate that reduces the largest
    /// residual shortfall, until the pending workload fits or no candidate
    /// helps.
    fn select_greedy(
        &self,
        snapshot: &Snapshot,
        cq_name: &str,
        pending: &Workload,
        mut remaining: Vec<Candidate>,
    ) -> Option<Vec<Candidate>> {
        let mut sim = snapshot.clone();
        let mut selected = Vec::new();

        loop {
            let cq = sim.cluster_queue(cq_name)?;
            match assignment::assign(&sim, cq, pending) {
                AssignmentOutcome::Fit(_) => return Some(selected),
                AssignmentOutcome::NoFit { shortfalls, .. } => {
                    if shortfalls.is_empty() {
                        // Structural failure; eviction cannot help
                        return None;
                    }
                    let contested = shortfalls
                        .iter()
                        .max_by_key(|(_, missing)| missing.millis())
                        .map(|(key, _)| key.clone())?;

                    let position = remaining
                        .iter()
                        .position(|candidate| self.reduces(&sim, candidate, &contested));
                    match position {
                        Some(index) => {
                            let candidate = remaining.remove(index);
                            sim.remove_admitted(
                                &candidate.victim.cluster_queue,
                                candidate.victim.uid,
                            );
                            selected.push(candidate);
                        }
                        None => return None,
                    }
                }
            }
        }
    }

    /// Whether evicting this candidate frees quota on the contested
    /// coordinate. Reclaim victims additionally must belong to a queue that
    /// is still above its nominal there.
    fn reduces(&self, sim: &Snapshot, candidate: &Candidate, contested: &FlavorResource) -> bool {
        let consumes = candidate
            .usage
            .get(contested)
            .copied()
            .unwrap_or(Quantity::ZERO);
        if consumes.is_zero() {
            return false;
        }
        if candidate.reclaim {
            match sim.cluster_queue(&candidate.victim.cluster_queue) {
                Some(owner) => owner.is_borrowing_on(contested),
                None => false,
            }
        } else {
            true
        }
    }

    /// Drop victims in reverse selection order while the pending workload
    /// still fits without them. Locally minimal, not globally optimal.
    fn minimize(
        &self,
        snapshot: &Snapshot,
        cq_name: &str,
        pending: &Workload,
        selected: Vec<Candidate>,
    ) -> Vec<Candidate> {
        let mut kept: Vec<bool> = vec![true; selected.len()];

        for index in (0..selected.len()).rev() {
            kept[index] = false;
            let mut sim = snapshot.clone();
            for (other, candidate) in selected.iter().enumerate() {
                if kept[other] {
                    sim.remove_admitted(&candidate.victim.cluster_queue, candidate.victim.uid);
                }
            }
            let fits = sim
                .cluster_queue(cq_name)
                .map(|cq| {
                    matches!(
                        assignment::assign(&sim, cq, pending),
                        AssignmentOutcome::Fit(_)
                    )
                })
                .unwrap_or(false);
            if !fits {
                kept[index] = true;
            }
        }

        selected
            .into_iter()
            .zip(kept)
            .filter_map(|(candidate, keep)| keep.then_some(candidate))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ObjectMeta, PodSet, PreemptionPolicies, Quantity, QueueingStrategy, UsageMap,
        WorkloadSpec,
    };
    use crate::cache::snapshot::{
        AdmittedEntry, CohortSnapshot, CqSnapshot, FlavorView, GroupView, QuotaLimit, Snapshot,
    };
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn key() -> FlavorResource {
        FlavorResource::new("x", "cpu")
    }

    fn admitted(name: &str, priority: i32, cpu: i64, age_secs: i64) -> AdmittedEntry {
        AdmittedEntry {
            uid: Uuid::new_v4(),
            name: name.to_string(),
            namespace: "default".to_string(),
            priority,
            admitted_at: Utc::now() - Duration::seconds(age_secs),
            resource_version: 1,
            usage: UsageMap::from([(key(), Quantity::from_units(cpu))]),
            pods_ready: true,
        }
    }

    fn queue(
        name: &str,
        cohort: Option<&str>,
        nominal: i64,
        preemption: PreemptionPolicies,
        admitted_entries: Vec<AdmittedEntry>,
    ) -> CqSnapshot {
        let usage: Quantity = admitted_entries
            .iter()
            .map(|e| e.usage.get(&key()).copied().unwrap_or(Quantity::ZERO))
            .sum();
        CqSnapshot {
            name: name.to_string(),
            cohort: cohort.map(|c| c.to_string()),
            strategy: QueueingStrategy::BestEffortFifo,
            namespace_selector: Some(Default::default()),
            preemption,
            groups: vec![GroupView {
                covered_resources: vec!["cpu".to_string()],
                flavors: vec![FlavorView {
                    name: "x".to_string(),
                    node_labels: Default::default(),
                    taints: vec![],
                    quotas: BTreeMap::from([(
                        "cpu".to_string(),
                        QuotaLimit {
                            nominal: Quantity::from_units(nominal),
                            borrowing_limit: None,
                        },
                    )]),
                }],
            }],
            usage: UsageMap::from([(key(), usage)]),
            admitted: admitted_entries.into_iter().map(|e| (e.uid, e)).collect(),
            active: true,
            all_pods_ready: true,
        }
    }

    fn snapshot(queues: Vec<CqSnapshot>) -> Snapshot {
        let mut cohorts: BTreeMap<String, CohortSnapshot> = BTreeMap::new();
        for cq in &queues {
            if let Some(cohort) = &cq.cohort {
                let aggregate = cohorts.entry(cohort.clone()).or_insert_with(|| {
                    CohortSnapshot {
                        name: cohort.clone(),
                        ..Default::default()
                    }
                });
                for group in &cq.groups {
                    for flavor in &group.flavors {
                        for (resource, limit) in &flavor.quotas {
                            let k = FlavorResource::new(flavor.name.clone(), resource.clone());
                            *aggregate.nominal.entry(k).or_insert(Quantity::ZERO) +=
                                limit.nominal;
                        }
                    }
                }
                for (k, used) in &cq.usage {
                    *aggregate.usage.entry(k.clone()).or_insert(Quantity::ZERO) += *used;
                }
            }
        }
        Snapshot::new(
            queues
                .into_iter()
                .map(|cq| (cq.name.clone(), Arc::new(cq)))
                .collect(),
            cohorts
                .into_iter()
                .map(|(name, cohort)| (name, Arc::new(cohort)))
                .collect(),
        )
    }

    fn pending(name: &str, priority: i32, cpu: i64) -> Workload {
        Workload {
            metadata: ObjectMeta::new(name, "default"),
            spec: WorkloadSpec {
                queue_name: "lq".to_string(),
                priority,
                pod_sets: vec![PodSet {
                    name: "main".to_string(),
                    count: 1,
                    requests: BTreeMap::from([(
                        "cpu".to_string(),
                        Quantity::from_units(cpu),
                    )]),
                    node_selector: Default::default(),
                    tolerations: vec![],
                }],
            },
            status: Default::default(),
        }
    }

    #[test]
    fn never_policies_are_immediately_infeasible() {
        let snap = snapshot(vec![queue(
            "a",
            None,
            10,
            PreemptionPolicies::default(),
            vec![admitted("v", 0, 10, 60)],
        )]);
        let planner = PreemptionPlanner::new();
        assert!(planner.plan(&snap, "a", &pending("w", 5, 4)).is_none());
    }

    #[test]
    fn within_queue_prefers_lowest_priority_most_recent() {
        let policies = PreemptionPolicies {
            within_cluster_queue: WithinClusterQueue::LowerPriority,
            ..Default::default()
        };
        let older_low = admitted("older-low", 1, 4, 60);
        let newer_low = admitted("newer-low", 1, 4, 10);
        let mid = admitted("mid", 3, 4, 30);
        let snap = snapshot(vec![queue(
            "a",
            None,
            12,
            policies,
            vec![older_low.clone(), newer_low.clone(), mid],
        )]);

        let planner = PreemptionPlanner::new();
        let victims = planner.plan(&snap, "a", &pending("w", 5, 4)).unwrap();
        assert_eq!(victims.len(), 1);
        // Equal priority: the most recently admitted goes first
        assert_eq!(victims[0].name, "newer-low");
    }

    #[test]
    fn equal_priority_is_never_a_within_queue_victim() {
        let policies = PreemptionPolicies {
            within_cluster_queue: WithinClusterQueue::LowerPriority,
            ..Default::default()
        };
        let snap = snapshot(vec![queue(
            "a",
            None,
            10,
            policies,
            vec![admitted("peer", 5, 10, 60)],
        )]);
        let planner = PreemptionPlanner::new();
        assert!(planner.plan(&snap, "a", &pending("w", 5, 4)).is_none());
    }

    #[test]
    fn reclaim_skips_peers_within_their_nominal() {
        let policies = PreemptionPolicies {
            reclaim_within_cohort: ReclaimWithinCohort::Any,
            ..Default::default()
        };
        // Both peers within nominal: nothing is reclaimable even though the
        // pool is exhausted for borrowing purposes
        let snap = snapshot(vec![
            queue("a", Some("c"), 10, PreemptionPolicies::default(), vec![
                admitted("a1", 0, 10, 60),
            ]),
            queue("b", Some("c"), 10, policies, vec![admitted("b1", 0, 5, 50)]),
        ]);
        let planner = PreemptionPlanner::new();
        // b asks for 6 > its free nominal of 5, and a is not borrowing
        assert!(planner.plan(&snap, "b", &pending("w", 5, 6)).is_none());
    }

    #[test]
    fn reclaim_does_not_extend_to_borrowing_needs() {
        let policies = PreemptionPolicies {
            reclaim_within_cohort: ReclaimWithinCohort::Any,
            ..Default::default()
        };
        // a borrows 5 over nominal; b wants 12, which exceeds b's own
        // nominal, so reclaim is off the table
        let snap = snapshot(vec![
            queue("a", Some("c"), 10, PreemptionPolicies::default(), vec![
                admitted("a1", 0, 15, 60),
            ]),
            queue("b", Some("c"), 10, policies, vec![]),
        ]);
        let planner = PreemptionPlanner::new();
        assert!(planner.plan(&snap, "b", &pending("w", 0, 12)).is_none());
    }

    #[test]
    fn reclaim_any_takes_higher_priority_victims() {
        let policies = PreemptionPolicies {
            reclaim_within_cohort: ReclaimWithinCohort::Any,
            ..Default::default()
        };
        let snap = snapshot(vec![
            queue("a", Some("c"), 10, PreemptionPolicies::default(), vec![
                admitted("a1", 9, 15, 60),
            ]),
            queue("b", Some("c"), 10, policies, vec![]),
        ]);
        let planner = PreemptionPlanner::new();
        let victims = planner.plan(&snap, "b", &pending("w", 0, 10)).unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].name, "a1");
        assert_eq!(victims[0].cluster_queue, "a");
    }
}
