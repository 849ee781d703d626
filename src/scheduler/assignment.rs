//! Flavor assignment for a whole Workload.
//!
//! Walks every pod-set against the queue's resource groups, charging earlier
//! pod-sets' usage tentatively so one cycle cannot hand the same quota out
//! twice within a workload.

use crate::api::{Admission, PodSetFlavors, Quantity, UsageMap, Workload};
use crate::cache::snapshot::{CqSnapshot, FitFailure, FitRequest, Snapshot};

/// A complete flavor assignment with its quota footprint.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub admission: Admission,
    pub usage: UsageMap,
    /// True when any coordinate lands above the queue's nominal quota.
    pub borrows: bool,
}

#[derive(Debug, Clone)]
pub enum AssignmentOutcome {
    Fit(Assignment),
    /// The request does not fit current quota. `shortfalls` is the missing
    /// amount per (flavor, resource) for the closest-fitting flavors; empty
    /// shortfalls mean the failure is structural (uncovered resource or no
    /// node-compatible flavor) and preemption cannot help.
    NoFit {
        shortfalls: UsageMap,
        reason: String,
    },
}

/// Assign flavors for every pod-set of a workload against one queue.
pub fn assign(snapshot: &Snapshot, cq: &CqSnapshot, workload: &Workload) -> AssignmentOutcome {
    assign_with(snapshot, cq, workload, true)
}

/// Like [`assign`] but counting only the queue's own nominal quota. Used to
/// decide whether a workload is entitled to reclaim cohort capacity.
pub fn fits_under_nominal(snapshot: &Snapshot, cq: &CqSnapshot, workload: &Workload) -> bool {
    matches!(
        assign_with(snapshot, cq, workload, false),
        AssignmentOutcome::Fit(_)
    )
}

fn assign_with(
    snapshot: &Snapshot,
    cq: &CqSnapshot,
    workload: &Workload,
    allow_borrowing: bool,
) -> AssignmentOutcome {
    let mut tentative = UsageMap::new();
    let mut pod_set_flavors = Vec::with_capacity(workload.spec.pod_sets.len());
    let mut borrows = false;
    let mut shortfalls = UsageMap::new();
    let mut failed = false;

    for pod_set in &workload.spec.pod_sets {
        let totals = pod_set.total_requests();
        let request = FitRequest {
            totals: &totals,
            node_selector: Some(&pod_set.node_selector),
            tolerations: &pod_set.tolerations,
        };

        match snapshot.fit_request(cq, &request, &tentative, allow_borrowing) {
            Ok(fit) => {
                for (key, amount) in &fit.usage {
                    *tentative.entry(key.clone()).or_insert(Quantity::ZERO) += *amount;
                }
                borrows |= fit.borrows;
                pod_set_flavors.push(PodSetFlavors {
                    name: pod_set.name.clone(),
                    flavors: fit.flavors,
                });
            }
            Err(FitFailure::NotCovered(resource)) => {
                return AssignmentOutcome::NoFit {
                    shortfalls: UsageMap::new(),
                    reason: format!(
                        "pod-set {} requests {resource}, which no resource group covers",
                        pod_set.name
                    ),
                };
            }
            Err(FitFailure::Incompatible) => {
                return AssignmentOutcome::NoFit {
                    shortfalls: UsageMap::new(),
                    reason: format!(
                        "no flavor is compatible with pod-set {}'s node constraints",
                        pod_set.name
                    ),
                };
            }
            Err(FitFailure::Insufficient {
                shortfalls: missing,
            }) => {
                failed = true;
                for (key, amount) in missing {
                    *shortfalls.entry(key).or_insert(Quantity::ZERO) += amount;
                }
            }
        }
    }

    if failed {
        AssignmentOutcome::NoFit {
            reason: "insufficient quota".to_string(),
            shortfalls,
        }
    } else {
        AssignmentOutcome::Fit(Assignment {
            admission: Admission {
                cluster_queue: cq.name.clone(),
                pod_set_flavors,
            },
            usage: tentative,
            borrows,
        })
    }
}
