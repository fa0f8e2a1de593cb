use crate::cluster::Cluster;
use crate::error::{Error, Result};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, info};

/// A workload the operator spawns for an Image.
pub trait ChildWorkload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("resource")
    }

    /// Whether pods of this workload are doing work that a delete would kill.
    fn is_active(&self) -> bool {
        false
    }
}

impl ChildWorkload for Deployment {}

impl ChildWorkload for Job {
    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/job-v1/#JobStatus
    fn is_active(&self) -> bool {
        self.status.as_ref().and_then(|s| s.active).unwrap_or(0) > 0
    }
}

/// Whether every field set in `desired` has the same value in `live`.
///
/// Objects are compared key by key, arrays element by element with equal
/// length. Fields only present in `live` (server defaults, status, fields of
/// other managers) are ignored. Strings below a `resources` key are compared
/// as quantities, since the API server normalizes `1000m` to `1`.
pub fn json_contains(live: &Value, desired: &Value) -> bool {
    contains(live, desired, false)
}

fn contains(live: &Value, desired: &Value, quantities: bool) -> bool {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => desired.iter().all(|(k, v)| {
            live.get(k)
                .is_some_and(|l| contains(l, v, quantities || k == "resources"))
        }),
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len()
                && live
                    .iter()
                    .zip(desired)
                    .all(|(l, d)| contains(l, d, quantities))
        }
        (Value::String(live), Value::String(desired)) if quantities => {
            match (parse_quantity(live), parse_quantity(desired)) {
                (Some(l), Some(d)) => (l - d).abs() <= 1e-9 * l.abs().max(d.abs()),
                _ => live == desired,
            }
        }
        (live, desired) => live == desired,
    }
}

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1048576.0),
    ("Gi", 1073741824.0),
    ("Ti", 1099511627776.0),
    ("Pi", 1125899906842624.0),
    ("Ei", 1152921504606846976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a Kubernetes resource quantity (`500m`, `1Gi`, `1e3`) into its value.
fn parse_quantity(quantity: &str) -> Option<f64> {
    if let Ok(value) = quantity.parse::<f64>() {
        return Some(value);
    }
    BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, scale)| {
            let number = quantity.strip_suffix(suffix)?.parse::<f64>().ok()?;
            Some(number * scale)
        })
}

fn to_value<K: ChildWorkload>(obj: &K) -> Result<Value> {
    serde_json::to_value(obj).map_err(|source| Error::Serialization {
        kind: K::kind_name(),
        source,
    })
}

/// Whether the live object already carries everything we would apply.
pub fn is_applied<K: ChildWorkload>(desired: &K, live: &K) -> Result<bool> {
    Ok(json_contains(&to_value(live)?, &to_value(desired)?))
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobPlan {
    Create,
    Unchanged,
    /// Jobs are immutable, so a differing spec means delete and apply again.
    Recreate,
}

pub fn plan_job(desired: &Job, live: Option<&Job>) -> Result<JobPlan> {
    let Some(live) = live else {
        return Ok(JobPlan::Create);
    };
    if is_applied(desired, live)? {
        return Ok(JobPlan::Unchanged);
    }
    if live.is_active() {
        return Err(Error::JobStillRunning(live.name_any()));
    }
    Ok(JobPlan::Recreate)
}

/// Server-side applies the Deployment unless the live object already matches.
/// Returns whether a patch was sent.
pub async fn apply_deployment<C: Cluster>(cluster: &C, desired: &Deployment) -> Result<bool> {
    let name = desired.name_any();
    if let Some(live) = cluster.get::<Deployment>(&name).await?
        && is_applied(desired, &live)?
    {
        debug!(deployment = %name, "deployment is up to date");
        return Ok(false);
    }
    info!(deployment = %name, "applying deployment");
    cluster.apply(desired).await?;
    Ok(true)
}

/// Creates the Job, or replaces a finished one whose spec no longer matches.
/// Returns whether anything was changed.
pub async fn apply_job<C: Cluster>(cluster: &C, desired: &Job) -> Result<bool> {
    let name = desired.name_any();
    let live = cluster.get::<Job>(&name).await?;
    match plan_job(desired, live.as_ref())? {
        JobPlan::Unchanged => {
            debug!(job = %name, "job is up to date");
            return Ok(false);
        }
        JobPlan::Create => info!(job = %name, "creating job"),
        JobPlan::Recreate => {
            info!(job = %name, "job spec changed, recreating");
            cluster.delete::<Job>(&name).await?;
        }
    }
    cluster.apply(desired).await?;
    Ok(true)
}
