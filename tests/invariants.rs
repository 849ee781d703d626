//! Accounting and policy invariants checked over full event flows.

mod common;

use common::{cluster_queue, flavor, local_queue, workload, Harness};

use batchgate::api::{
    FlavorResource, Quantity, ReclaimWithinCohort, UsageMap, WithinClusterQueue,
};
use batchgate::store::{EventAction, WatchEvent};

fn cpu_key() -> FlavorResource {
    FlavorResource::new("x", "cpu")
}

fn cpu_usage(usage: &UsageMap) -> Quantity {
    usage.get(&cpu_key()).copied().unwrap_or(Quantity::ZERO)
}

/// Cache usage must equal the sum of requests of admitted, unfinished
/// workloads at every quiescent point.
#[tokio::test]
async fn usage_reconciles_with_admitted_workloads() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    harness.store.apply_cluster_queue(cluster_queue("a", None, 20));
    harness.store.apply_local_queue(local_queue("default", "lq", "a"));

    let w1 = workload("w1", "default", "lq", 0, 5, 40);
    let w2 = workload("w2", "default", "lq", 0, 7, 30);
    let w3 = workload("w3", "default", "lq", 0, 4, 20);
    let uids = [w1.metadata.uid, w2.metadata.uid, w3.metadata.uid];
    harness.store.apply_workload(w1);
    harness.store.apply_workload(w2);
    harness.store.apply_workload(w3);

    harness.cycle().await;
    assert_eq!(
        cpu_usage(&harness.cache.usage("a").unwrap()),
        Quantity::from_units(16)
    );

    // One finishes, releasing its share
    harness.store.finish_workload(uids[1]);
    harness.drain().await;
    assert_eq!(
        cpu_usage(&harness.cache.usage("a").unwrap()),
        Quantity::from_units(9)
    );

    // One is deleted outright
    harness.store.delete_workload(uids[0]);
    harness.drain().await;
    assert_eq!(
        cpu_usage(&harness.cache.usage("a").unwrap()),
        Quantity::from_units(4)
    );

    // What remains matches a recomputation from the store
    let remaining = harness.store.get_workload(uids[2]).unwrap();
    let recomputed = remaining
        .admission_usage(remaining.status.admission.as_ref().unwrap())
        .unwrap();
    assert_eq!(harness.cache.usage("a").unwrap(), recomputed);
}

/// Usage never exceeds nominal + borrowingLimit on any coordinate.
#[tokio::test]
async fn borrowing_limit_is_a_hard_cap() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    let mut a = cluster_queue("a", Some("c"), 10);
    a.spec.resource_groups[0].flavors[0].resources[0].borrowing_limit =
        Some(Quantity::from_units(3));
    harness.store.apply_cluster_queue(a);
    harness.store.apply_cluster_queue(cluster_queue("b", Some("c"), 10));
    harness.store.apply_local_queue(local_queue("default", "lq-a", "a"));

    let fits = workload("fits", "default", "lq-a", 0, 13, 30);
    let fits_uid = fits.metadata.uid;
    harness.store.apply_workload(fits);
    let outcome = harness.cycle().await;
    assert_eq!(outcome.admitted, vec![fits_uid]);

    // One more milli-unit would breach nominal + borrowingLimit
    let over = workload("over", "default", "lq-a", 0, 1, 10);
    let over_uid = over.metadata.uid;
    harness.store.apply_workload(over);
    let outcome = harness.cycle().await;
    assert!(outcome.admitted.is_empty());
    assert_eq!(outcome.exhausted, vec![over_uid]);

    assert_eq!(
        cpu_usage(&harness.cache.usage("a").unwrap()),
        Quantity::from_units(13)
    );
}

/// Cohort usage never exceeds the cohort's summed nominal quota.
#[tokio::test]
async fn cohort_pool_is_a_hard_cap() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    harness.store.apply_cluster_queue(cluster_queue("a", Some("c"), 10));
    harness.store.apply_cluster_queue(cluster_queue("b", Some("c"), 10));
    harness.store.apply_local_queue(local_queue("default", "lq-a", "a"));
    harness.store.apply_local_queue(local_queue("default", "lq-b", "b"));

    let big = workload("big", "default", "lq-a", 0, 12, 30);
    harness.store.apply_workload(big);
    harness.cycle().await;

    // 12 + 9 would exceed the pool of 20
    let blocked = workload("blocked", "default", "lq-b", 0, 9, 10);
    let blocked_uid = blocked.metadata.uid;
    harness.store.apply_workload(blocked);
    let outcome = harness.cycle().await;
    assert!(outcome.admitted.is_empty());
    assert_eq!(outcome.exhausted, vec![blocked_uid]);

    let total = cpu_usage(&harness.cache.usage("a").unwrap())
        + cpu_usage(&harness.cache.usage("b").unwrap());
    assert!(total <= Quantity::from_units(20));
}

/// The planner's victim set is locally minimal: it never evicts more
/// workloads than the shortfall requires.
#[tokio::test]
async fn preemption_victim_set_is_minimal() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    let mut a = cluster_queue("a", None, 12);
    a.spec.preemption.within_cluster_queue = WithinClusterQueue::LowerPriority;
    harness.store.apply_cluster_queue(a);
    harness.store.apply_local_queue(local_queue("default", "lq", "a"));

    for (name, age) in [("v1", 60), ("v2", 50), ("v3", 40)] {
        harness.store.apply_workload(workload(name, "default", "lq", 1, 4, age));
    }
    harness.cycle().await;
    assert_eq!(
        cpu_usage(&harness.cache.usage("a").unwrap()),
        Quantity::from_units(12)
    );

    // Needs 5: two evictions free 8, one would free only 4
    let urgent = workload("urgent", "default", "lq", 5, 5, 10);
    harness.store.apply_workload(urgent);
    let outcome = harness.cycle().await;
    assert_eq!(outcome.preemptions.len(), 1);
    assert_eq!(outcome.preemptions[0].1.len(), 2);
}

/// Under a LowerPriority reclaim policy no victim outranks the pending
/// workload.
#[tokio::test]
async fn reclaim_respects_priority_bound() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    harness.store.apply_cluster_queue(cluster_queue("a", Some("c"), 10));
    let mut b = cluster_queue("b", Some("c"), 10);
    b.spec.preemption.reclaim_within_cohort = ReclaimWithinCohort::LowerPriority;
    harness.store.apply_cluster_queue(b);
    harness.store.apply_local_queue(local_queue("default", "lq-a", "a"));
    harness.store.apply_local_queue(local_queue("default", "lq-b", "b"));

    // `a` borrows with one important and one unimportant workload
    harness.store.apply_workload(workload("a-high", "default", "lq-a", 9, 6, 60));
    harness.store.apply_workload(workload("a-low", "default", "lq-a", 1, 6, 50));
    harness.cycle().await;
    assert_eq!(
        cpu_usage(&harness.cache.usage("a").unwrap()),
        Quantity::from_units(12)
    );

    let pending = workload("b-claim", "default", "lq-b", 5, 10, 10);
    let pending_uid = pending.metadata.uid;
    harness.store.apply_workload(pending);
    let outcome = harness.cycle().await;

    assert_eq!(outcome.preemptions.len(), 1);
    let victims = &outcome.preemptions[0].1;
    assert!(!victims.is_empty());
    assert!(victims.iter().all(|v| v.priority < 5));

    let outcome = harness.cycle().await;
    assert_eq!(outcome.admitted, vec![pending_uid]);
}

/// Replaying an admission event changes no accounting.
#[tokio::test]
async fn admission_events_are_idempotent() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    harness.store.apply_cluster_queue(cluster_queue("a", None, 10));
    harness.store.apply_local_queue(local_queue("default", "lq", "a"));

    let w = workload("w", "default", "lq", 0, 4, 30);
    let uid = w.metadata.uid;
    harness.store.apply_workload(w);
    harness.cycle().await;

    let before = harness.cache.usage("a").unwrap();
    let observed = harness.store.get_workload(uid).unwrap();
    for _ in 0..3 {
        harness
            .handle_event(WatchEvent::Workload(EventAction::Modified, observed.clone()))
            .await;
    }

    assert_eq!(harness.cache.usage("a").unwrap(), before);
    assert_eq!(harness.cache.admitted_count("a"), 1);
    assert_eq!(harness.queues.pending_count("a"), 0);
}

/// Published ClusterQueue status equals recomputation from raw workloads.
#[tokio::test]
async fn status_round_trips_from_workloads() {
    let mut harness = Harness::new();
    harness.store.apply_flavor(flavor("x"));
    harness.store.apply_cluster_queue(cluster_queue("a", None, 10));
    harness.store.apply_local_queue(local_queue("default", "lq", "a"));

    let admitted = workload("admitted", "default", "lq", 0, 6, 30);
    let pending = workload("pending", "default", "lq", 0, 8, 20);
    let admitted_uid = admitted.metadata.uid;
    harness.store.apply_workload(admitted);
    harness.store.apply_workload(pending);
    harness.cycle().await;

    let status = harness.store.get_cluster_queue("a").unwrap().status;
    assert_eq!(status.admitted_workloads, 1);
    assert_eq!(status.pending_workloads, 1);

    let from_store = harness.store.get_workload(admitted_uid).unwrap();
    let recomputed = from_store
        .admission_usage(from_store.status.admission.as_ref().unwrap())
        .unwrap();
    assert_eq!(
        status.flavors_usage[0].resources[0].total,
        cpu_usage(&recomputed)
    );
}
