//! Job-framework adapters.
//!
//! Concrete job kinds (plain batch jobs, MPI jobs, ...) share one Workload
//! contract: pod-set shape extraction, a suspension flag and a readiness
//! signal. One adapter per framework registers here; the admission core
//! itself only ever sees Workloads.

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::api::{ObjectMeta, PodSet, Quantity, Toleration, Workload, WorkloadSpec};
use crate::config::IntegrationsConfig;
use crate::store::JobObject;
use crate::Result;

pub trait JobAdapter: Send + Sync {
    fn framework(&self) -> &'static str;

    /// Extract the job's pod-set shapes into a Workload.
    fn build_workload(&self, job: &JobObject) -> Result<Workload>;

    /// Whether the job is currently held from starting pods. Only suspended
    /// jobs go through admission; a running job is the framework's problem.
    fn is_suspended(&self, job: &JobObject) -> bool {
        job.suspended
    }

    /// Readiness signal backing the PodsReady condition.
    fn pods_ready(&self, job: &JobObject) -> bool;
}

/// Enabled adapters, selected by the `integrations.frameworks` option.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Box<dyn JobAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(config: &IntegrationsConfig) -> Self {
        let mut registry = Self::default();
        for framework in &config.frameworks {
            match framework.as_str() {
                "batch/job" => registry.register(Box::new(BatchJobAdapter)),
                "mpi/job" => registry.register(Box::new(MpiJobAdapter)),
                // Unknown names are rejected by config validation
                _ => {}
            }
        }
        registry
    }

    pub fn register(&mut self, adapter: Box<dyn JobAdapter>) {
        self.adapters.insert(adapter.framework(), adapter);
    }

    pub fn get(&self, framework: &str) -> Option<&dyn JobAdapter> {
        self.adapters.get(framework).map(|adapter| adapter.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

fn workload_shell(job: &JobObject, priority: i32, pod_sets: Vec<PodSet>) -> Workload {
    let mut metadata = ObjectMeta::new(format!("{}-workload", job.name), job.namespace.clone());
    // The workload shares the job's identity so later job events (readiness,
    // completion) map back without an index
    metadata.uid = job.uid;
    metadata.creation_timestamp = job.creation_timestamp;
    Workload {
        metadata,
        spec: WorkloadSpec {
            queue_name: job.queue_name.clone().unwrap_or_default(),
            priority,
            pod_sets,
        },
        status: Default::default(),
    }
}

fn parse_requests(requests: &BTreeMap<String, String>) -> Result<BTreeMap<String, Quantity>> {
    requests
        .iter()
        .map(|(resource, amount)| {
            Quantity::parse(amount)
                .map(|quantity| (resource.clone(), quantity))
                .ok_or_else(|| {
                    anyhow!("invalid quantity {amount:?} for resource {resource}").into()
                })
        })
        .collect()
}

/// Plain parallel batch job: one homogeneous pod-set.
#[derive(Deserialize)]
struct BatchJobSpec {
    #[serde(default = "default_parallelism")]
    parallelism: u32,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    requests: BTreeMap<String, String>,
    #[serde(default)]
    node_selector: HashMap<String, String>,
    #[serde(default)]
    tolerations: Vec<Toleration>,
    #[serde(default)]
    ready_pods: u32,
}

fn default_parallelism() -> u32 {
    1
}

pub struct BatchJobAdapter;

impl BatchJobAdapter {
    fn spec(job: &JobObject) -> Result<BatchJobSpec> {
        serde_json::from_value(job.payload.clone())
            .context("malformed batch job payload")
            .map_err(Into::into)
    }
}

impl JobAdapter for BatchJobAdapter {
    fn framework(&self) -> &'static str {
        "batch/job"
    }

    fn build_workload(&self, job: &JobObject) -> Result<Workload> {
        let spec = Self::spec(job)?;
        let pod_set = PodSet {
            name: "main".to_string(),
            count: spec.parallelism,
            requests: parse_requests(&spec.requests)?,
            node_selector: spec.node_selector,
            tolerations: spec.tolerations,
        };
        Ok(workload_shell(job, spec.priority, vec![pod_set]))
    }

    fn pods_ready(&self, job: &JobObject) -> bool {
        Self::spec(job)
            .map(|spec| spec.ready_pods >= spec.parallelism)
            .unwrap_or(false)
    }
}

/// MPI-style job: a single launcher pod plus a homogeneous worker pool.
#[derive(Deserialize)]
struct MpiJobSpec {
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    launcher_requests: BTreeMap<String, String>,
    worker_replicas: u32,
    #[serde(default)]
    worker_requests: BTreeMap<String, String>,
    #[serde(default)]
    node_selector: HashMap<String, String>,
    #[serde(default)]
    tolerations: Vec<Toleration>,
    #[serde(default)]
    ready_replicas: u32,
}

pub struct MpiJobAdapter;

impl MpiJobAdapter {
    fn spec(job: &JobObject) -> Result<MpiJobSpec> {
        serde_json::from_value(job.payload.clone())
            .context("malformed mpi job payload")
            .map_err(Into::into)
    }
}

impl JobAdapter for MpiJobAdapter {
    fn framework(&self) -> &'static str {
        "mpi/job"
    }

    fn build_workload(&self, job: &JobObject) -> Result<Workload> {
        let spec = Self::spec(job)?;
        let pod_sets = vec![
            PodSet {
                name: "launcher".to_string(),
                count: 1,
                requests: parse_requests(&spec.launcher_requests)?,
                node_selector: spec.node_selector.clone(),
                tolerations: spec.tolerations.clone(),
            },
            PodSet {
                name: "workers".to_string(),
                count: spec.worker_replicas,
                requests: parse_requests(&spec.worker_requests)?,
                node_selector: spec.node_selector,
                tolerations: spec.tolerations,
            },
        ];
        Ok(workload_shell(job, spec.priority, pod_sets))
    }

    fn pods_ready(&self, job: &JobObject) -> bool {
        // The launcher only starts once every worker is up
        Self::spec(job)
            .map(|spec| spec.ready_replicas >= spec.worker_replicas + 1)
            .unwrap_or(false)
    }
}
