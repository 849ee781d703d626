//! Authoritative in-memory quota snapshot.
//!
//! The cache holds every ClusterQueue's configured quota and the usage of
//! admitted (and tentatively assumed) Workloads, plus the derived cohort
//! graph. All usage arithmetic lives here; the scheduler and planner only
//! read frozen snapshots of it.

pub mod snapshot;

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{
    Admission, ClusterQueue, ClusterQueueSpec, CohortName, FlavorName, FlavorResource,
    FlavorUsage, Quantity, QueueingStrategy, ResourceFlavor, ResourceName, ResourceUsage,
    UsageMap, Workload, MAX_FLAVORS_PER_GROUP, MAX_RESOURCES_PER_GROUP, MAX_RESOURCE_GROUPS,
};
use crate::{AdmissionError, Result, WorkloadUid};
use snapshot::{
    AdmittedEntry, CohortSnapshot, CqSnapshot, FlavorView, GroupView, QuotaLimit, Snapshot,
};

/// Reasons a ClusterQueue is not accepting admissions.
pub const REASON_READY: &str = "Ready";
pub const REASON_FLAVOR_NOT_FOUND: &str = "FlavorNotFound";
pub const REASON_INVALID_CONFIG: &str = "InvalidConfiguration";
pub const REASON_TERMINATING: &str = "Terminating";

/// Quota table of one ClusterQueue, flattened from its resource groups.
#[derive(Debug, Clone)]
struct GroupQuotas {
    covered_resources: Vec<ResourceName>,
    flavors: Vec<FlavorQuota>,
}

#[derive(Debug, Clone)]
struct FlavorQuota {
    name: FlavorName,
    quotas: BTreeMap<ResourceName, QuotaLimit>,
}

struct CqEntry {
    name: String,
    spec: ClusterQueueSpec,
    /// Captured at first insert; the strategy is immutable after creation.
    strategy: QueueingStrategy,
    groups: Vec<GroupQuotas>,
    usage: UsageMap,
    admitted: BTreeMap<WorkloadUid, AdmittedEntry>,
    active: bool,
    inactive_reason: String,
    invalid: bool,
    terminating: bool,
}

struct AssumedWorkload {
    workload: Workload,
    cluster_queue: String,
    usage: UsageMap,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    flavors: HashMap<FlavorName, ResourceFlavor>,
    queues: BTreeMap<String, CqEntry>,
    cohorts: HashMap<CohortName, BTreeSet<String>>,
    assumed: HashMap<WorkloadUid, AssumedWorkload>,
    /// Which ClusterQueue currently accounts for each admitted Workload.
    admitted_index: HashMap<WorkloadUid, String>,
}

/// Fit report for a bare resource request against one ClusterQueue.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub fits: bool,
    pub borrows: bool,
    /// Shortfall per (flavor, resource) of the closest-fitting flavors when
    /// the request does not fit.
    pub exceeded_by: UsageMap,
}

#[derive(Default)]
pub struct Cache {
    state: RwLock<CacheState>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_flavor(&self, flavor: ResourceFlavor) {
        let mut state = self.state.write();
        debug!("flavor {} upserted", flavor.name);
        state.flavors.insert(flavor.name.clone(), flavor);
        refresh_all_active(&mut state);
    }

    pub fn delete_flavor(&self, name: &str) {
        let mut state = self.state.write();
        if state.flavors.remove(name).is_some() {
            debug!("flavor {} deleted", name);
            refresh_all_active(&mut state);
        }
    }

    /// Insert or rebuild a ClusterQueue's quota table.
    ///
    /// Structural problems (borrowing limit without a cohort, a flavor or
    /// resource in more than one group, a (flavor, resource) shared outside
    /// one cohort) mark the queue inactive and return InvalidConfig. A
    /// reference to an unknown flavor only deactivates the queue.
    pub fn upsert_cluster_queue(&self, cluster_queue: &ClusterQueue) -> Result<()> {
        let mut state = self.state.write();
        let name = cluster_queue.name.clone();

        let strategy = match state.queues.get(&name) {
            Some(existing) if existing.strategy != cluster_queue.spec.queueing_strategy => {
                warn!(
                    "cluster queue {} attempted to change its queueing strategy; keeping {:?}",
                    name, existing.strategy
                );
                existing.strategy
            }
            Some(existing) => existing.strategy,
            None => cluster_queue.spec.queueing_strategy,
        };

        let validation = validate_spec(&state, &name, &cluster_queue.spec);
        let groups = build_groups(&cluster_queue.spec);

        let (usage, admitted) = match state.queues.remove(&name) {
            Some(old) => {
                detach_cohort(&mut state, &name, &old.spec.cohort);
                (old.usage, old.admitted)
            }
            None => (UsageMap::new(), BTreeMap::new()),
        };

        let invalid = validation.is_err();
        let entry = CqEntry {
            name: name.clone(),
            spec: cluster_queue.spec.clone(),
            strategy,
            groups,
            usage,
            admitted,
            active: false,
            inactive_reason: String::new(),
            invalid,
            terminating: false,
        };
        state.queues.insert(name.clone(), entry);
        attach_cohort(&mut state, &name, &cluster_queue.spec.cohort);
        refresh_all_active(&mut state);

        match validation {
            Ok(()) => {
                info!("cluster queue {} upserted", name);
                Ok(())
            }
            Err(reason) => {
                warn!("cluster queue {} has invalid configuration: {}", name, reason);
                Err(AdmissionError::InvalidConfig { queue: name, reason })
            }
        }
    }

    /// Remove a ClusterQueue. While admitted Workloads remain the queue only
    /// drains: it stops admitting but keeps accounting for its usage.
    pub fn delete_cluster_queue(&self, name: &str) {
        let mut state = self.state.write();
        let drained = match state.queues.get_mut(name) {
            Some(entry) if !entry.admitted.is_empty() => {
                entry.terminating = true;
                info!(
                    "cluster queue {} terminating with {} admitted workloads",
                    name,
                    entry.admitted.len()
                );
                false
            }
            Some(_) => true,
            None => return,
        };
        if drained {
            if let Some(entry) = state.queues.remove(name) {
                detach_cohort(&mut state, name, &entry.spec.cohort);
            }
            info!("cluster queue {} deleted", name);
        }
        refresh_all_active(&mut state);
    }

    /// Apply the authoritative state of a Workload. Idempotent on identical
    /// admissions; merges (or supersedes) any assumed record for it.
    /// Returns the queues whose accounting changed.
    pub fn add_or_update_workload(&self, workload: &Workload) -> Vec<String> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let uid = workload.uid();
        let mut affected = Vec::new();

        // The observed object replaces any tentative record
        if let Some(assumed) = state.assumed.remove(&uid) {
            release_usage(state, &assumed.cluster_queue, &assumed.usage);
            affected.push(assumed.cluster_queue);
        }
        let previous = match state.admitted_index.remove(&uid) {
            Some(previous_cq) => {
                affected.push(previous_cq.clone());
                remove_admitted(state, &previous_cq, uid)
            }
            None => None,
        };

        if workload.is_finished() {
            maybe_finish_terminating(state);
            affected.dedup();
            return affected;
        }

        let admission = match &workload.status.admission {
            Some(admission) => admission.clone(),
            None => {
                affected.dedup();
                return affected;
            }
        };

        let usage = match workload.admission_usage(&admission) {
            Some(usage) => usage,
            None => {
                error!(
                    "admission of workload {} references pod-sets or resources it does not declare; rebuilding {}",
                    workload.metadata.name, admission.cluster_queue
                );
                rebuild_queue(state, &admission.cluster_queue);
                affected.push(admission.cluster_queue.clone());
                affected.dedup();
                return affected;
            }
        };

        let cq_name = admission.cluster_queue.clone();
        // A re-observed admission keeps its original admission time
        let admitted_at = previous
            .filter(|p| p.uid == uid)
            .map(|p| p.admitted_at)
            .unwrap_or_else(Utc::now);

        match state.queues.get_mut(&cq_name) {
            Some(entry) => {
                apply_usage(&mut entry.usage, &usage);
                entry.admitted.insert(
                    uid,
                    AdmittedEntry {
                        uid,
                        name: workload.metadata.name.clone(),
                        namespace: workload.metadata.namespace.clone(),
                        priority: workload.priority(),
                        admitted_at,
                        resource_version: workload.metadata.resource_version,
                        usage,
                        pods_ready: workload.pods_ready(),
                    },
                );
                affected.push(cq_name.clone());
                state.admitted_index.insert(uid, cq_name);
            }
            None => {
                warn!(
                    "workload {} admitted to unknown cluster queue {}",
                    workload.metadata.name, cq_name
                );
            }
        }
        affected.dedup();
        affected
    }

    /// Forget a Workload entirely, releasing any usage charged for it.
    /// Returns the queues whose accounting changed.
    pub fn delete_workload(&self, uid: WorkloadUid) -> Vec<String> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut affected = Vec::new();
        if let Some(assumed) = state.assumed.remove(&uid) {
            release_usage(state, &assumed.cluster_queue, &assumed.usage);
            affected.push(assumed.cluster_queue);
        }
        if let Some(cq) = state.admitted_index.remove(&uid) {
            remove_admitted(state, &cq, uid);
            affected.push(cq);
        }
        maybe_finish_terminating(state);
        affected.dedup();
        affected
    }

    /// Tentatively charge an admission before its write is observed back,
    /// so the quota cannot be double-admitted in the interim.
    pub fn assume_workload(
        &self,
        workload: &Workload,
        admission: &Admission,
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.write();
        let uid = workload.uid();

        if state.assumed.contains_key(&uid) {
            return Err(AdmissionError::AlreadyAssumed(uid));
        }
        if state.admitted_index.contains_key(&uid) {
            // Already observed; nothing to assume
            return Ok(());
        }

        let cq_name = admission.cluster_queue.clone();
        let usage = workload
            .admission_usage(admission)
            .ok_or_else(|| AdmissionError::InvalidConfig {
                queue: cq_name.clone(),
                reason: "admission references undeclared pod-sets or resources".to_string(),
            })?;

        let entry = state
            .queues
            .get_mut(&cq_name)
            .ok_or_else(|| AdmissionError::ClusterQueueNotFound(cq_name.clone()))?;
        apply_usage(&mut entry.usage, &usage);

        state.assumed.insert(
            uid,
            AssumedWorkload {
                workload: workload.clone(),
                cluster_queue: cq_name,
                usage,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Drop a tentative admission that never materialized.
    pub fn forget_workload(&self, uid: WorkloadUid) {
        let mut state = self.state.write();
        if let Some(assumed) = state.assumed.remove(&uid) {
            release_usage(&mut state, &assumed.cluster_queue, &assumed.usage);
            debug!("forgot assumed workload {}", uid);
        }
    }

    /// Release assumed admissions past their grace horizon. Returns the
    /// affected Workloads with the queue they were charged to, so the caller
    /// can requeue them.
    pub fn expire_assumed(&self, now: Instant) -> Vec<(String, Workload)> {
        let mut state = self.state.write();
        let expired: Vec<WorkloadUid> = state
            .assumed
            .iter()
            .filter(|(_, assumed)| assumed.expires_at <= now)
            .map(|(uid, _)| *uid)
            .collect();

        let mut workloads = Vec::with_capacity(expired.len());
        for uid in expired {
            if let Some(assumed) = state.assumed.remove(&uid) {
                warn!(
                    "assumed admission of workload {} expired before it was observed",
                    assumed.workload.metadata.name
                );
                release_usage(&mut state, &assumed.cluster_queue, &assumed.usage);
                workloads.push((assumed.cluster_queue, assumed.workload));
            }
        }
        workloads
    }

    /// Freeze a consistent view of every queue and cohort for one cycle.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();

        let mut queues = BTreeMap::new();
        for (name, entry) in &state.queues {
            let mut assumed_here = false;
            for assumed in state.assumed.values() {
                if assumed.cluster_queue == *name {
                    assumed_here = true;
                    break;
                }
            }
            let all_pods_ready =
                !assumed_here && entry.admitted.values().all(|w| w.pods_ready);

            let groups = entry
                .groups
                .iter()
                .map(|group| GroupView {
                    covered_resources: group.covered_resources.clone(),
                    flavors: group
                        .flavors
                        .iter()
                        .map(|flavor| {
                            let resolved = state.flavors.get(&flavor.name);
                            FlavorView {
                                name: flavor.name.clone(),
                                node_labels: resolved
                                    .map(|f| f.node_labels.clone())
                                    .unwrap_or_default(),
                                taints: resolved.map(|f| f.taints.clone()).unwrap_or_default(),
                                quotas: flavor.quotas.clone(),
                            }
                        })
                        .collect(),
                })
                .collect();

            queues.insert(
                name.clone(),
                Arc::new(CqSnapshot {
                    name: name.clone(),
                    cohort: entry.spec.cohort.clone(),
                    strategy: entry.strategy,
                    namespace_selector: entry.spec.namespace_selector.clone(),
                    preemption: entry.spec.preemption,
                    groups,
                    usage: entry.usage.clone(),
                    admitted: entry.admitted.clone(),
                    active: entry.active,
                    all_pods_ready,
                }),
            );
        }

        let mut cohorts = BTreeMap::new();
        for (cohort_name, members) in &state.cohorts {
            let mut aggregate = CohortSnapshot {
                name: cohort_name.clone(),
                ..Default::default()
            };
            for member in members {
                if let Some(entry) = state.queues.get(member) {
                    for group in &entry.groups {
                        for flavor in &group.flavors {
                            for (resource, limit) in &flavor.quotas {
                                let key =
                                    FlavorResource::new(flavor.name.clone(), resource.clone());
                                *aggregate.nominal.entry(key).or_insert(Quantity::ZERO) +=
                                    limit.nominal;
                            }
                        }
                    }
                    for (key, used) in &entry.usage {
                        *aggregate.usage.entry(key.clone()).or_insert(Quantity::ZERO) += *used;
                    }
                }
            }
            cohorts.insert(cohort_name.clone(), Arc::new(aggregate));
        }

        Snapshot::new(queues, cohorts)
    }

    /// Current usage of one ClusterQueue.
    pub fn usage(&self, cq_name: &str) -> Option<UsageMap> {
        self.state.read().queues.get(cq_name).map(|e| e.usage.clone())
    }

    /// Can a bare resource request fit this queue right now, and would it
    /// borrow?
    pub fn can_fit(
        &self,
        cq_name: &str,
        requests: &BTreeMap<ResourceName, Quantity>,
    ) -> Option<FitReport> {
        let snap = self.snapshot();
        let cq = snap.cluster_queue(cq_name)?;
        let request = snapshot::FitRequest {
            totals: requests,
            node_selector: None,
            tolerations: &[],
        };
        Some(match snap.fit_request(cq, &request, &UsageMap::new(), true) {
            Ok(fit) => FitReport {
                fits: true,
                borrows: fit.borrows,
                exceeded_by: UsageMap::new(),
            },
            Err(snapshot::FitFailure::Insufficient { shortfalls }) => FitReport {
                fits: false,
                borrows: false,
                exceeded_by: shortfalls,
            },
            Err(_) => FitReport {
                fits: false,
                borrows: false,
                exceeded_by: UsageMap::new(),
            },
        })
    }

    /// Per-flavor usage for the queue's status, total and borrowed.
    pub fn flavors_usage(&self, cq_name: &str) -> Vec<FlavorUsage> {
        let state = self.state.read();
        let entry = match state.queues.get(cq_name) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        let mut flavors = Vec::new();
        for group in &entry.groups {
            for flavor in &group.flavors {
                let resources = flavor
                    .quotas
                    .iter()
                    .map(|(resource, limit)| {
                        let key = FlavorResource::new(flavor.name.clone(), resource.clone());
                        let total = entry.usage.get(&key).copied().unwrap_or(Quantity::ZERO);
                        ResourceUsage {
                            name: resource.clone(),
                            total,
                            borrowed: total.saturating_sub(limit.nominal),
                        }
                    })
                    .collect();
                flavors.push(FlavorUsage {
                    name: flavor.name.clone(),
                    resources,
                });
            }
        }
        flavors
    }

    /// Admitted workloads charged to a queue, counting assumed admissions
    /// still awaiting their observed event.
    pub fn admitted_count(&self, cq_name: &str) -> u32 {
        let state = self.state.read();
        let observed = state
            .queues
            .get(cq_name)
            .map(|e| e.admitted.len())
            .unwrap_or(0);
        let assumed = state
            .assumed
            .values()
            .filter(|a| a.cluster_queue == cq_name)
            .count();
        (observed + assumed) as u32
    }

    pub fn is_active(&self, cq_name: &str) -> bool {
        self.state
            .read()
            .queues
            .get(cq_name)
            .map(|e| e.active)
            .unwrap_or(false)
    }

    /// Why the queue is (in)active, as a condition reason.
    pub fn active_reason(&self, cq_name: &str) -> Option<(bool, String)> {
        self.state
            .read()
            .queues
            .get(cq_name)
            .map(|e| (e.active, e.inactive_reason.clone()))
    }

    /// Record PodsReady observations for admitted workloads.
    pub fn set_pods_ready(&self, uid: WorkloadUid, ready: bool) {
        let mut state = self.state.write();
        if let Some(cq) = state.admitted_index.get(&uid).cloned() {
            if let Some(entry) = state.queues.get_mut(&cq) {
                if let Some(admitted) = entry.admitted.get_mut(&uid) {
                    admitted.pods_ready = ready;
                }
            }
        }
    }
}

fn apply_usage(target: &mut UsageMap, delta: &UsageMap) {
    for (key, amount) in delta {
        *target.entry(key.clone()).or_insert(Quantity::ZERO) += *amount;
    }
}

/// Release usage from a queue, rebuilding its books if the subtraction
/// would underflow.
fn release_usage(state: &mut CacheState, cq_name: &str, delta: &UsageMap) {
    let underflow = match state.queues.get_mut(cq_name) {
        Some(entry) => {
            let mut underflow = false;
            for (key, amount) in delta {
                let used = entry.usage.entry(key.clone()).or_insert(Quantity::ZERO);
                match used.checked_sub(*amount) {
                    Some(remaining) => *used = remaining,
                    None => {
                        underflow = true;
                        *used = Quantity::ZERO;
                    }
                }
            }
            underflow
        }
        None => false,
    };

    if underflow {
        error!(
            "usage underflow detected on cluster queue {}; rebuilding from admitted workloads",
            cq_name
        );
        rebuild_queue(state, cq_name);
    }
}

fn remove_admitted(
    state: &mut CacheState,
    cq_name: &str,
    uid: WorkloadUid,
) -> Option<AdmittedEntry> {
    let entry = state
        .queues
        .get_mut(cq_name)
        .and_then(|entry| entry.admitted.remove(&uid))?;
    release_usage(state, cq_name, &entry.usage);
    Some(entry)
}

/// Recompute a queue's usage from its authoritative admitted set plus any
/// still-assumed workloads. Recovery path for accounting faults.
fn rebuild_queue(state: &mut CacheState, cq_name: &str) {
    let assumed_usage: Vec<UsageMap> = state
        .assumed
        .values()
        .filter(|a| a.cluster_queue == cq_name)
        .map(|a| a.usage.clone())
        .collect();

    if let Some(entry) = state.queues.get_mut(cq_name) {
        let mut usage = UsageMap::new();
        for admitted in entry.admitted.values() {
            apply_usage(&mut usage, &admitted.usage);
        }
        for extra in &assumed_usage {
            apply_usage(&mut usage, extra);
        }
        entry.usage = usage;
        info!("cluster queue {} usage rebuilt", cq_name);
    }
}

fn maybe_finish_terminating(state: &mut CacheState) {
    let drained: Vec<String> = state
        .queues
        .values()
        .filter(|entry| entry.terminating && entry.admitted.is_empty())
        .map(|entry| entry.name.clone())
        .collect();
    for name in drained {
        if let Some(entry) = state.queues.remove(&name) {
            detach_cohort(state, &name, &entry.spec.cohort);
            info!("cluster queue {} finished draining and was removed", name);
        }
    }
}

fn attach_cohort(state: &mut CacheState, cq_name: &str, cohort: &Option<CohortName>) {
    if let Some(cohort) = cohort {
        state
            .cohorts
            .entry(cohort.clone())
            .or_default()
            .insert(cq_name.to_string());
    }
}

fn detach_cohort(state: &mut CacheState, cq_name: &str, cohort: &Option<CohortName>) {
    if let Some(cohort) = cohort {
        if let Some(members) = state.cohorts.get_mut(cohort) {
            members.remove(cq_name);
            if members.is_empty() {
                state.cohorts.remove(cohort);
            }
        }
    }
}

fn build_groups(spec: &ClusterQueueSpec) -> Vec<GroupQuotas> {
    spec.resource_groups
        .iter()
        .map(|group| GroupQuotas {
            covered_resources: group.covered_resources.clone(),
            flavors: group
                .flavors
                .iter()
                .map(|flavor| FlavorQuota {
                    name: flavor.name.clone(),
                    quotas: flavor
                        .resources
                        .iter()
                        .map(|quota| {
                            (
                                quota.name.clone(),
                                QuotaLimit {
                                    nominal: quota.nominal_quota,
                                    borrowing_limit: quota.borrowing_limit,
                                },
                            )
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect()
}

/// Structural validation of a ClusterQueue spec against the rest of the
/// cache. Returns the failure reason.
fn validate_spec(
    state: &CacheState,
    name: &str,
    spec: &ClusterQueueSpec,
) -> std::result::Result<(), String> {
    if spec.resource_groups.len() > MAX_RESOURCE_GROUPS {
        return Err(format!(
            "at most {MAX_RESOURCE_GROUPS} resource groups are allowed"
        ));
    }

    let mut seen_resources: BTreeSet<&str> = BTreeSet::new();
    let mut seen_pairs: BTreeSet<FlavorResource> = BTreeSet::new();

    for group in &spec.resource_groups {
        if group.covered_resources.is_empty() || group.flavors.is_empty() {
            return Err("resource groups must declare resources and flavors".to_string());
        }
        if group.covered_resources.len() > MAX_RESOURCES_PER_GROUP {
            return Err(format!(
                "at most {MAX_RESOURCES_PER_GROUP} resources per group are allowed"
            ));
        }
        if group.flavors.len() > MAX_FLAVORS_PER_GROUP {
            return Err(format!(
                "at most {MAX_FLAVORS_PER_GROUP} flavors per group are allowed"
            ));
        }

        for resource in &group.covered_resources {
            if !seen_resources.insert(resource) {
                return Err(format!("resource {resource} appears in more than one group"));
            }
        }

        for flavor in &group.flavors {
            let declared: BTreeSet<&str> =
                flavor.resources.iter().map(|r| r.name.as_str()).collect();
            let covered: BTreeSet<&str> = group
                .covered_resources
                .iter()
                .map(|r| r.as_str())
                .collect();
            if declared != covered {
                return Err(format!(
                    "flavor {} must declare a quota for every covered resource of its group",
                    flavor.name
                ));
            }

            for quota in &flavor.resources {
                if quota.borrowing_limit.is_some() && spec.cohort.is_none() {
                    return Err(format!(
                        "flavor {} sets a borrowing limit but the queue has no cohort",
                        flavor.name
                    ));
                }
                let pair = FlavorResource::new(flavor.name.clone(), quota.name.clone());
                if !seen_pairs.insert(pair.clone()) {
                    return Err(format!("quota for {pair} is declared twice"));
                }
            }
        }
    }

    // A (flavor, resource) pair represents physical capacity; it may be
    // shared only among queues of one cohort
    for (other_name, other) in &state.queues {
        if other_name == name {
            continue;
        }
        let same_cohort = spec.cohort.is_some() && other.spec.cohort == spec.cohort;
        if same_cohort {
            continue;
        }
        for group in &other.groups {
            for flavor in &group.flavors {
                for resource in flavor.quotas.keys() {
                    let pair = FlavorResource::new(flavor.name.clone(), resource.clone());
                    if seen_pairs.contains(&pair) {
                        return Err(format!(
                            "quota for {pair} overlaps cluster queue {other_name} outside the cohort"
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

fn refresh_all_active(state: &mut CacheState) {
    let flavor_names: BTreeSet<&str> = state.flavors.keys().map(|s| s.as_str()).collect();

    for entry in state.queues.values_mut() {
        let missing: Option<&FlavorQuota> = entry
            .groups
            .iter()
            .flat_map(|g| g.flavors.iter())
            .find(|f| !flavor_names.contains(f.name.as_str()));

        let (active, reason) = if entry.terminating {
            (false, REASON_TERMINATING.to_string())
        } else if entry.invalid {
            (false, REASON_INVALID_CONFIG.to_string())
        } else if let Some(flavor) = missing {
            (false, format!("{}: {}", REASON_FLAVOR_NOT_FOUND, flavor.name))
        } else {
            (true, REASON_READY.to_string())
        };

        if entry.active != active {
            info!(
                "cluster queue {} is now {} ({})",
                entry.name,
                if active { "active" } else { "inactive" },
                reason
            );
        }
        entry.active = active;
        entry.inactive_reason = reason;
    }
}
