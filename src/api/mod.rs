//! Core object model.
//!
//! These are the objects the admission core consumes from the object store
//! and the records it writes back: ResourceFlavor, ClusterQueue, LocalQueue,
//! Workload and the Admission assignment attached to admitted Workloads.

pub mod selector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

use crate::WorkloadUid;
pub use selector::{LabelSelector, Taint, TaintEffect, Toleration};

pub type ResourceName = String;
pub type FlavorName = String;
pub type CohortName = String;
pub type ClusterQueueName = String;

/// A (flavor, resource) quota coordinate. All usage arithmetic is keyed on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlavorResource {
    pub flavor: FlavorName,
    pub resource: ResourceName,
}

impl FlavorResource {
    pub fn new(flavor: impl Into<FlavorName>, resource: impl Into<ResourceName>) -> Self {
        Self {
            flavor: flavor.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for FlavorResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flavor, self.resource)
    }
}

/// Usage or quota amounts keyed by (flavor, resource). BTreeMap keeps
/// iteration deterministic across cycles.
pub type UsageMap = BTreeMap<FlavorResource, Quantity>;

/// Fixed-point resource quantity in milli-units.
///
/// "2" parses to 2000 millis, "1500m" to 1500. Arithmetic saturates; a
/// negative result is an invariant violation detected by the cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub const fn from_millis(millis: i64) -> Self {
        Quantity(millis)
    }

    pub const fn from_units(units: i64) -> Self {
        Quantity(units.saturating_mul(1000))
    }

    pub const fn millis(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }

    /// Subtraction that reports underflow instead of clamping.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            None
        } else {
            Some(Quantity(self.0 - other.0))
        }
    }

    pub fn scale(self, count: u32) -> Quantity {
        Quantity(self.0.saturating_mul(count as i64))
    }

    pub fn parse(input: &str) -> Option<Quantity> {
        let trimmed = input.trim();
        if let Some(millis) = trimmed.strip_suffix('m') {
            return millis.parse::<i64>().ok().map(Quantity);
        }
        if let Ok(units) = trimmed.parse::<i64>() {
            return Some(Quantity::from_units(units));
        }
        trimmed
            .parse::<f64>()
            .ok()
            .map(|units| Quantity((units * 1000.0).round() as i64))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl std::ops::Add for Quantity {
    type Output = Quantity;

    fn add(self, other: Quantity) -> Quantity {
        self.saturating_add(other)
    }
}

impl std::ops::AddAssign for Quantity {
    fn add_assign(&mut self, other: Quantity) {
        *self = self.saturating_add(other);
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Quantity::saturating_add)
    }
}

/// Common object metadata carried by every watched object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub uid: Uuid,
    pub creation_timestamp: DateTime<Utc>,
    /// Bumped by the store on every write; admission and eviction writes are
    /// conditional on the version a decision was computed against.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Uuid::new_v4(),
            creation_timestamp: Utc::now(),
            resource_version: 0,
            labels: HashMap::new(),
        }
    }
}

/// A named quota dimension tied to a class of nodes via labels and taints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceFlavor {
    pub name: FlavorName,
    #[serde(default)]
    pub node_labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl ResourceFlavor {
    pub fn new(name: impl Into<FlavorName>) -> Self {
        Self {
            name: name.into(),
            node_labels: HashMap::new(),
            taints: Vec::new(),
        }
    }
}

/// Whether an unadmittable head blocks or yields to younger workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueingStrategy {
    /// Workloads are attempted strictly in order; a head that cannot be
    /// admitted blocks everything behind it.
    StrictFifo,
    /// Heap order is still respected, but an unadmittable workload does not
    /// gate its successors.
    #[default]
    BestEffortFifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReclaimWithinCohort {
    #[default]
    Never,
    LowerPriority,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WithinClusterQueue {
    #[default]
    Never,
    LowerPriority,
}

/// Preemption policies of a ClusterQueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionPolicies {
    #[serde(default)]
    pub reclaim_within_cohort: ReclaimWithinCohort,
    #[serde(default)]
    pub within_cluster_queue: WithinClusterQueue,
}

/// Quota declared by one flavor for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub name: ResourceName,
    pub nominal_quota: Quantity,
    /// Cap on consumption above nominal, drawn from cohort peers' unused
    /// nominal. None means unlimited borrowing; only legal with a cohort.
    #[serde(default)]
    pub borrowing_limit: Option<Quantity>,
}

/// Ordered list of flavors providing quota for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorQuotas {
    pub name: FlavorName,
    pub resources: Vec<ResourceQuota>,
}

/// A set of resources and the ordered flavors that provide them.
///
/// Every flavor in a group must declare a quota for every covered resource,
/// in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub covered_resources: Vec<ResourceName>,
    pub flavors: Vec<FlavorQuotas>,
}

pub const MAX_RESOURCE_GROUPS: usize = 16;
pub const MAX_FLAVORS_PER_GROUP: usize = 16;
pub const MAX_RESOURCES_PER_GROUP: usize = 16;

/// A named quota holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterQueue {
    pub name: ClusterQueueName,
    pub spec: ClusterQueueSpec,
    #[serde(default)]
    pub status: ClusterQueueStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterQueueSpec {
    /// ClusterQueues sharing a cohort name may borrow unused nominal quota
    /// from each other. None means no borrowing in either direction.
    #[serde(default)]
    pub cohort: Option<CohortName>,
    pub resource_groups: Vec<ResourceGroup>,
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
    /// None ⇒ no namespace may submit; empty selector ⇒ all namespaces may.
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub preemption: PreemptionPolicies,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterQueueStatus {
    #[serde(default)]
    pub flavors_usage: Vec<FlavorUsage>,
    #[serde(default)]
    pub pending_workloads: u32,
    #[serde(default)]
    pub admitted_workloads: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorUsage {
    pub name: FlavorName,
    pub resources: Vec<ResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub name: ResourceName,
    /// Total used quota, including any borrowed amount.
    pub total: Quantity,
    /// Used quota above nominal, i.e. drawn from the cohort.
    pub borrowed: Quantity,
}

/// Namespaced pointer routing Workloads to a ClusterQueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalQueue {
    pub name: String,
    pub namespace: String,
    pub cluster_queue: ClusterQueueName,
}

/// One homogeneous set of pods within a Workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSet {
    pub name: String,
    pub count: u32,
    /// Per-pod resource requests.
    pub requests: BTreeMap<ResourceName, Quantity>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

impl PodSet {
    /// Aggregate request of the whole pod-set, per resource.
    pub fn total_requests(&self) -> BTreeMap<ResourceName, Quantity> {
        self.requests
            .iter()
            .map(|(name, per_pod)| (name.clone(), per_pod.scale(self.count)))
            .collect()
    }
}

/// The unit of admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Name of the LocalQueue (in the Workload's namespace) it was submitted
    /// through.
    pub queue_name: String,
    /// Higher is more important. Ties break on creation time, then uid.
    #[serde(default)]
    pub priority: i32,
    pub pod_sets: Vec<PodSet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub admission: Option<Admission>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Flavor assignment recorded on an admitted Workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub cluster_queue: ClusterQueueName,
    pub pod_set_flavors: Vec<PodSetFlavors>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSetFlavors {
    /// Name of the pod-set this assignment is for.
    pub name: String,
    /// Assigned flavor per requested resource.
    pub flavors: BTreeMap<ResourceName, FlavorName>,
}

impl Workload {
    pub fn uid(&self) -> WorkloadUid {
        self.metadata.uid
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    pub fn is_admitted(&self) -> bool {
        self.status.admission.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.has_condition(ConditionKind::Finished)
    }

    pub fn pods_ready(&self) -> bool {
        self.has_condition(ConditionKind::PodsReady)
    }

    pub fn has_condition(&self, kind: ConditionKind) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == kind && c.status)
    }

    /// Set or update a condition. Identical (kind, status, reason) is a
    /// no-op so replayed events don't churn transition times.
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.kind == condition.kind)
        {
            if existing.status == condition.status && existing.reason == condition.reason {
                return;
            }
            *existing = condition;
        } else {
            self.status.conditions.push(condition);
        }
    }

    /// Usage this Workload's admission contributes, per (flavor, resource).
    ///
    /// Returns None when the admission references a pod-set or resource the
    /// spec does not declare.
    pub fn admission_usage(&self, admission: &Admission) -> Option<UsageMap> {
        let mut usage = UsageMap::new();
        for assigned in &admission.pod_set_flavors {
            let pod_set = self.spec.pod_sets.iter().find(|ps| ps.name == assigned.name)?;
            for (resource, flavor) in &assigned.flavors {
                let per_pod = pod_set.requests.get(resource)?;
                let key = FlavorResource::new(flavor.clone(), resource.clone());
                let entry = usage.entry(key).or_insert(Quantity::ZERO);
                *entry += per_pod.scale(pod_set.count);
            }
        }
        Some(usage)
    }
}

/// Observed condition on a Workload or ClusterQueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(kind: ConditionKind, status: bool, reason: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            reason: reason.into(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    QuotaReserved,
    Admitted,
    Evicted,
    PodsReady,
    Finished,
    Active,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionKind::QuotaReserved => "QuotaReserved",
            ConditionKind::Admitted => "Admitted",
            ConditionKind::Evicted => "Evicted",
            ConditionKind::PodsReady => "PodsReady",
            ConditionKind::Finished => "Finished",
            ConditionKind::Active => "Active",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_parse_and_display() {
        assert_eq!(Quantity::parse("2"), Some(Quantity::from_units(2)));
        assert_eq!(Quantity::parse("1500m"), Some(Quantity::from_millis(1500)));
        assert_eq!(Quantity::parse("2.5"), Some(Quantity::from_millis(2500)));
        assert_eq!(Quantity::parse("garbage"), None);

        assert_eq!(Quantity::from_units(4).to_string(), "4");
        assert_eq!(Quantity::from_millis(1500).to_string(), "1500m");
    }

    #[test]
    fn quantity_checked_sub_reports_underflow() {
        let four = Quantity::from_units(4);
        let ten = Quantity::from_units(10);
        assert_eq!(ten.checked_sub(four), Some(Quantity::from_units(6)));
        assert_eq!(four.checked_sub(ten), None);
    }

    #[test]
    fn pod_set_total_requests_scales_by_count() {
        let pod_set = PodSet {
            name: "workers".to_string(),
            count: 3,
            requests: BTreeMap::from([("cpu".to_string(), Quantity::from_units(2))]),
            node_selector: HashMap::new(),
            tolerations: vec![],
        };
        let totals = pod_set.total_requests();
        assert_eq!(totals.get("cpu"), Some(&Quantity::from_units(6)));
    }

    #[test]
    fn admission_usage_sums_pod_sets_on_same_flavor() {
        let workload = Workload {
            metadata: ObjectMeta::new("w", "default"),
            spec: WorkloadSpec {
                queue_name: "lq".to_string(),
                priority: 0,
                pod_sets: vec![
                    PodSet {
                        name: "driver".to_string(),
                        count: 1,
                        requests: BTreeMap::from([("cpu".to_string(), Quantity::from_units(1))]),
                        node_selector: HashMap::new(),
                        tolerations: vec![],
                    },
                    PodSet {
                        name: "workers".to_string(),
                        count: 2,
                        requests: BTreeMap::from([("cpu".to_string(), Quantity::from_units(2))]),
                        node_selector: HashMap::new(),
                        tolerations: vec![],
                    },
                ],
            },
            status: WorkloadStatus::default(),
        };

        let admission = Admission {
            cluster_queue: "cq".to_string(),
            pod_set_flavors: vec![
                PodSetFlavors {
                    name: "driver".to_string(),
                    flavors: BTreeMap::from([("cpu".to_string(), "default".to_string())]),
                },
                PodSetFlavors {
                    name: "workers".to_string(),
                    flavors: BTreeMap::from([("cpu".to_string(), "default".to_string())]),
                },
            ],
        };

        let usage = workload.admission_usage(&admission).unwrap();
        assert_eq!(
            usage.get(&FlavorResource::new("default", "cpu")),
            Some(&Quantity::from_units(5))
        );
    }

    #[test]
    fn set_condition_is_idempotent() {
        let mut workload = Workload {
            metadata: ObjectMeta::new("w", "default"),
            spec: WorkloadSpec {
                queue_name: "lq".to_string(),
                priority: 0,
                pod_sets: vec![],
            },
            status: WorkloadStatus::default(),
        };

        workload.set_condition(Condition::new(ConditionKind::Admitted, true, "Admitted"));
        let first_transition = workload.status.conditions[0].last_transition_time;

        workload.set_condition(Condition::new(ConditionKind::Admitted, true, "Admitted"));
        assert_eq!(workload.status.conditions.len(), 1);
        assert_eq!(
            workload.status.conditions[0].last_transition_time,
            first_transition
        );
    }
}
