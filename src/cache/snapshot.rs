//! Frozen per-cycle view of quota and usage.
//!
//! A snapshot is taken at cycle start and updated in place as the cycle
//! admits workloads, so later candidates see quota consumed earlier in the
//! same cycle. Queues are held behind `Arc` and deep-copied only on first
//! mutation, keeping snapshot cost proportional to cycle activity.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::api::selector::{selector_compatible, tolerates_taints};
use crate::api::{
    ClusterQueueName, CohortName, FlavorName, FlavorResource, LabelSelector, PreemptionPolicies,
    Quantity, QueueingStrategy, ResourceName, Taint, Toleration, UsageMap,
};
use crate::WorkloadUid;

/// Quota declared for one (flavor, resource) coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimit {
    pub nominal: Quantity,
    pub borrowing_limit: Option<Quantity>,
}

/// A flavor inside a resource group, with its node class resolved.
#[derive(Debug, Clone)]
pub struct FlavorView {
    pub name: FlavorName,
    pub node_labels: HashMap<String, String>,
    pub taints: Vec<Taint>,
    pub quotas: BTreeMap<ResourceName, QuotaLimit>,
}

/// One resource group: covered resources and the ordered flavors providing
/// them.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub covered_resources: Vec<ResourceName>,
    pub flavors: Vec<FlavorView>,
}

/// An admitted workload as the cache accounts for it.
#[derive(Debug, Clone)]
pub struct AdmittedEntry {
    pub uid: WorkloadUid,
    pub name: String,
    pub namespace: String,
    pub priority: i32,
    pub admitted_at: DateTime<Utc>,
    pub resource_version: u64,
    pub usage: UsageMap,
    pub pods_ready: bool,
}

/// Frozen state of one ClusterQueue.
#[derive(Debug, Clone)]
pub struct CqSnapshot {
    pub name: ClusterQueueName,
    pub cohort: Option<CohortName>,
    pub strategy: QueueingStrategy,
    pub namespace_selector: Option<LabelSelector>,
    pub preemption: PreemptionPolicies,
    pub groups: Vec<GroupView>,
    pub usage: UsageMap,
    pub admitted: BTreeMap<WorkloadUid, AdmittedEntry>,
    pub active: bool,
    /// True when every admission charged to this queue has reported
    /// PodsReady (assumed-but-unobserved admissions count as not ready).
    pub all_pods_ready: bool,
}

impl CqSnapshot {
    pub fn usage_of(&self, key: &FlavorResource) -> Quantity {
        self.usage.get(key).copied().unwrap_or(Quantity::ZERO)
    }

    /// Quota limit declared for a (flavor, resource), if any group covers it.
    pub fn limit(&self, key: &FlavorResource) -> Option<QuotaLimit> {
        self.groups.iter().find_map(|group| {
            group
                .flavors
                .iter()
                .find(|flavor| flavor.name == key.flavor)
                .and_then(|flavor| flavor.quotas.get(&key.resource))
                .copied()
        })
    }

    /// Usage above nominal per (flavor, resource).
    pub fn borrowed(&self) -> UsageMap {
        self.usage
            .iter()
            .filter_map(|(key, used)| {
                let nominal = self.limit(key).map(|l| l.nominal).unwrap_or(Quantity::ZERO);
                used.checked_sub(nominal)
                    .filter(|b| !b.is_zero())
                    .map(|b| (key.clone(), b))
            })
            .collect()
    }

    /// Whether this queue is over its nominal quota on the given coordinate.
    pub fn is_borrowing_on(&self, key: &FlavorResource) -> bool {
        match self.limit(key) {
            Some(limit) => self.usage_of(key) > limit.nominal,
            None => false,
        }
    }
}

/// Cohort aggregates: Σ nominal (the reclaimable pool) and Σ usage across
/// member queues.
#[derive(Debug, Clone, Default)]
pub struct CohortSnapshot {
    pub name: CohortName,
    pub nominal: UsageMap,
    pub usage: UsageMap,
}

impl CohortSnapshot {
    pub fn nominal_of(&self, key: &FlavorResource) -> Quantity {
        self.nominal.get(key).copied().unwrap_or(Quantity::ZERO)
    }

    pub fn usage_of(&self, key: &FlavorResource) -> Quantity {
        self.usage.get(key).copied().unwrap_or(Quantity::ZERO)
    }
}

/// A fit query for one pod-set (or one bare request set).
pub struct FitRequest<'a> {
    /// Aggregate request per resource (count × per-pod).
    pub totals: &'a BTreeMap<ResourceName, Quantity>,
    pub node_selector: Option<&'a HashMap<String, String>>,
    pub tolerations: &'a [Toleration],
}

/// Successful flavor selection for one request across all groups.
#[derive(Debug, Clone, Default)]
pub struct GroupFit {
    /// Chosen flavor per requested resource.
    pub flavors: BTreeMap<ResourceName, FlavorName>,
    /// Usage delta this request would add, per (flavor, resource).
    pub usage: UsageMap,
    /// True when any coordinate lands above the queue's nominal quota.
    pub borrows: bool,
}

/// Why a request does not fit.
#[derive(Debug, Clone)]
pub enum FitFailure {
    /// A requested resource is covered by no resource group.
    NotCovered(ResourceName),
    /// Every candidate flavor fell short; shortfalls are those of the
    /// closest-fitting flavor per group.
    Insufficient { shortfalls: UsageMap },
    /// No flavor was compatible with the request's node constraints.
    Incompatible,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    queues: BTreeMap<ClusterQueueName, Arc<CqSnapshot>>,
    cohorts: BTreeMap<CohortName, Arc<CohortSnapshot>>,
}

impl Snapshot {
    pub fn new(
        queues: BTreeMap<ClusterQueueName, Arc<CqSnapshot>>,
        cohorts: BTreeMap<CohortName, Arc<CohortSnapshot>>,
    ) -> Self {
        Self { queues, cohorts }
    }

    pub fn cluster_queue(&self, name: &str) -> Option<&CqSnapshot> {
        self.queues.get(name).map(Arc::as_ref)
    }

    pub fn cohort(&self, name: &str) -> Option<&CohortSnapshot> {
        self.cohorts.get(name).map(Arc::as_ref)
    }

    pub fn cohort_of(&self, cq: &CqSnapshot) -> Option<&CohortSnapshot> {
        cq.cohort.as_deref().and_then(|name| self.cohort(name))
    }

    /// Member queues of a cohort, in deterministic order.
    pub fn cohort_members(&self, cohort: &str) -> Vec<&CqSnapshot> {
        self.queues
            .values()
            .filter(|cq| cq.cohort.as_deref() == Some(cohort))
            .map(Arc::as_ref)
            .collect()
    }

    /// Charge usage to a queue (and its cohort) inside this snapshot.
    pub fn add_usage(&mut self, cq_name: &str, delta: &UsageMap) {
        if let Some(entry) = self.queues.get_mut(cq_name) {
            let cq = Arc::make_mut(entry);
            for (key, amount) in delta {
                *cq.usage.entry(key.clone()).or_insert(Quantity::ZERO) += *amount;
            }
            let cohort_name = cq.cohort.clone();
            if let Some(cohort_name) = cohort_name {
                if let Some(cohort) = self.cohorts.get_mut(&cohort_name) {
                    let cohort = Arc::make_mut(cohort);
                    for (key, amount) in delta {
                        *cohort.usage.entry(key.clone()).or_insert(Quantity::ZERO) += *amount;
                    }
                }
            }
        }
    }

    /// Release usage from a queue (and its cohort) inside this snapshot.
    pub fn sub_usage(&mut self, cq_name: &str, delta: &UsageMap) {
        if let Some(entry) = self.queues.get_mut(cq_name) {
            let cq = Arc::make_mut(entry);
            for (key, amount) in delta {
                if let Some(used) = cq.usage.get_mut(key) {
                    *used = used.saturating_sub(*amount);
                }
            }
            let cohort_name = cq.cohort.clone();
            if let Some(cohort_name) = cohort_name {
                if let Some(cohort) = self.cohorts.get_mut(&cohort_name) {
                    let cohort = Arc::make_mut(cohort);
                    for (key, amount) in delta {
                        if let Some(used) = cohort.usage.get_mut(key) {
                            *used = used.saturating_sub(*amount);
                        }
                    }
                }
            }
        }
    }

    /// Drop an admitted workload from the snapshot, releasing its usage.
    /// Used by the preemption planner to simulate victim removal.
    pub fn remove_admitted(&mut self, cq_name: &str, uid: WorkloadUid) -> Option<AdmittedEntry> {
        let entry = {
            let cq = self.queues.get_mut(cq_name)?;
            Arc::make_mut(cq).admitted.remove(&uid)?
        };
        self.sub_usage(cq_name, &entry.usage);
        Some(entry)
    }

    /// Headroom in millis for one coordinate: how much more the queue may
    /// consume there. Negative when already over.
    ///
    /// Two caps apply when borrowing: the queue's own
    /// nominal + borrowingLimit, and the cohort pool (Σ usage across peers
    /// may never exceed Σ nominal). Without a cohort, or with borrowing
    /// disallowed, only the nominal quota counts.
    fn headroom_millis(
        &self,
        cq: &CqSnapshot,
        key: &FlavorResource,
        limit: &QuotaLimit,
        tentative: &UsageMap,
        allow_borrowing: bool,
    ) -> i64 {
        let tentative_here = tentative.get(key).copied().unwrap_or(Quantity::ZERO);
        let used = cq.usage_of(key) + tentative_here;

        let cohort = if allow_borrowing {
            self.cohort_of(cq)
        } else {
            None
        };
        match cohort {
            Some(cohort) => {
                let own_cap = match limit.borrowing_limit {
                    Some(cap) => limit.nominal.millis().saturating_add(cap.millis()),
                    None => i64::MAX,
                };
                let own_headroom = own_cap.saturating_sub(used.millis());
                let pool_headroom = cohort.nominal_of(key).millis()
                    - cohort.usage_of(key).millis()
                    - tentative_here.millis();
                own_headroom.min(pool_headroom)
            }
            None => limit.nominal.millis() - used.millis(),
        }
    }

    /// Resolve flavors for one request against one queue.
    ///
    /// Walks the queue's resource groups; within each group, flavors are
    /// attempted in declared order and the first one satisfying every
    /// covered resource (quota and node compatibility) wins. Groups are
    /// independent. `tentative` carries usage charged earlier for the same
    /// workload (previous pod-sets) that the live snapshot does not yet see.
    /// With `allow_borrowing` off, only the queue's own nominal quota counts.
    pub fn fit_request(
        &self,
        cq: &CqSnapshot,
        request: &FitRequest<'_>,
        tentative: &UsageMap,
        allow_borrowing: bool,
    ) -> Result<GroupFit, FitFailure> {
        let mut fit = GroupFit::default();
        let mut shortfalls = UsageMap::new();
        let mut any_compatible = true;

        for (resource, _) in request.totals.iter() {
            let covered = cq
                .groups
                .iter()
                .any(|group| group.covered_resources.contains(resource));
            if !covered {
                return Err(FitFailure::NotCovered(resource.clone()));
            }
        }

        for group in &cq.groups {
            let needed: BTreeMap<&ResourceName, Quantity> = group
                .covered_resources
                .iter()
                .filter_map(|resource| {
                    request
                        .totals
                        .get(resource)
                        .map(|amount| (resource, *amount))
                })
                .collect();
            if needed.is_empty() {
                continue;
            }

            let mut best_shortfall: Option<UsageMap> = None;
            let mut group_compatible = false;
            let mut chosen: Option<&FlavorView> = None;

            for flavor in &group.flavors {
                if let Some(node_selector) = request.node_selector {
                    if !selector_compatible(node_selector, &flavor.node_labels) {
                        continue;
                    }
                }
                if !tolerates_taints(request.tolerations, &flavor.taints) {
                    continue;
                }
                group_compatible = true;

                let mut flavor_shortfall = UsageMap::new();
                for (resource, amount) in &needed {
                    let key = FlavorResource::new(flavor.name.clone(), (*resource).clone());
                    let limit = match flavor.quotas.get(*resource) {
                        Some(limit) => *limit,
                        None => QuotaLimit {
                            nominal: Quantity::ZERO,
                            borrowing_limit: None,
                        },
                    };
                    let headroom =
                        self.headroom_millis(cq, &key, &limit, tentative, allow_borrowing);
                    let missing = amount.millis() - headroom;
                    if missing > 0 {
                        flavor_shortfall.insert(key, Quantity::from_millis(missing));
                    }
                }

                if flavor_shortfall.is_empty() {
                    chosen = Some(flavor);
                    break;
                }

                let closer = match &best_shortfall {
                    None => true,
                    Some(best) => {
                        let total: i64 = flavor_shortfall.values().map(|q| q.millis()).sum();
                        let best_total: i64 = best.values().map(|q| q.millis()).sum();
                        total < best_total
                    }
                };
                if closer {
                    best_shortfall = Some(flavor_shortfall);
                }
            }

            match chosen {
                Some(flavor) => {
                    for (resource, amount) in &needed {
                        let key = FlavorResource::new(flavor.name.clone(), (*resource).clone());
                        let nominal = flavor
                            .quotas
                            .get(*resource)
                            .map(|l| l.nominal)
                            .unwrap_or(Quantity::ZERO);
                        let tentative_here =
                            tentative.get(&key).copied().unwrap_or(Quantity::ZERO);
                        let after = cq.usage_of(&key) + tentative_here + *amount;
                        if after > nominal {
                            fit.borrows = true;
                        }
                        fit.flavors.insert((*resource).clone(), flavor.name.clone());
                        *fit.usage.entry(key).or_insert(Quantity::ZERO) += *amount;
                    }
                }
                None => {
                    if !group_compatible {
                        any_compatible = false;
                    }
                    if let Some(best) = best_shortfall {
                        for (key, missing) in best {
                            let slot = shortfalls.entry(key).or_insert(Quantity::ZERO);
                            *slot = (*slot).max(missing);
                        }
                    }
                }
            }
        }

        if shortfalls.is_empty() && any_compatible {
            Ok(fit)
        } else if !any_compatible && shortfalls.is_empty() {
            Err(FitFailure::Incompatible)
        } else {
            Err(FitFailure::Insufficient { shortfalls })
        }
    }
}
