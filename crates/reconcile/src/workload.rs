//! Mutators for workload controllers (apps/v1 Deployment).

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Affinity, Container, EnvVar, PodSpec, Toleration, TopologySpreadConstraint};

use crate::catalog::{Field, MultiFieldSync};
use crate::mutator::{Mutator, Pipeline};

fn pod_spec(d: &Deployment) -> Option<&PodSpec> {
    d.spec.as_ref()?.template.spec.as_ref()
}

fn pod_spec_mut(d: &mut Deployment) -> &mut PodSpec {
    d.spec.get_or_insert_with(Default::default).template.spec.get_or_insert_with(Default::default)
}

fn containers(d: &Deployment) -> &[Container] {
    pod_spec(d).map(|p| p.containers.as_slice()).unwrap_or(&[])
}

/// Run `f` over each desired container paired with the existing container of
/// the same name. Containers only present on one side are left alone.
fn for_each_container_pair(
    desired: &Deployment,
    existing: &mut Deployment,
    mut f: impl FnMut(&Container, &mut Container) -> bool,
) -> bool {
    let Some(live) = existing.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
        return false;
    };
    let mut changed = false;
    for want in containers(desired) {
        if let Some(have) = live.containers.iter_mut().find(|c| c.name == want.name) {
            changed |= f(want, have);
        }
    }
    changed
}

pub fn replicas() -> Field<Deployment, Option<i32>> {
    Field::<Deployment, Option<i32>>::new(
        "replicas",
        |d| d.spec.as_ref().map(|s| &s.replicas),
        |d| &mut d.spec.get_or_insert_with(Default::default).replicas,
    )
}

pub fn object_labels() -> Field<Deployment, Option<BTreeMap<String, String>>> {
    Field::<Deployment, Option<BTreeMap<String, String>>>::new("labels", |d| Some(&d.metadata.labels), |d| &mut d.metadata.labels)
}

pub fn pod_template_labels() -> Field<Deployment, Option<BTreeMap<String, String>>> {
    Field::<Deployment, Option<BTreeMap<String, String>>>::new(
        "pod-template-labels",
        |d| d.spec.as_ref()?.template.metadata.as_ref().map(|m| &m.labels),
        |d| &mut d.spec.get_or_insert_with(Default::default).template.metadata.get_or_insert_with(Default::default).labels,
    )
}

pub fn affinity() -> Field<Deployment, Option<Affinity>> {
    Field::<Deployment, Option<Affinity>>::new("affinity", |d| pod_spec(d).map(|p| &p.affinity), |d| &mut pod_spec_mut(d).affinity)
}

pub fn tolerations() -> Field<Deployment, Option<Vec<Toleration>>> {
    Field::<Deployment, Option<Vec<Toleration>>>::new(
        "tolerations",
        |d| pod_spec(d).map(|p| &p.tolerations),
        |d| &mut pod_spec_mut(d).tolerations,
    )
}

pub fn priority_class_name() -> Field<Deployment, Option<String>> {
    Field::<Deployment, Option<String>>::new(
        "priority-class-name",
        |d| pod_spec(d).map(|p| &p.priority_class_name),
        |d| &mut pod_spec_mut(d).priority_class_name,
    )
}

pub fn topology_spread_constraints() -> Field<Deployment, Option<Vec<TopologySpreadConstraint>>> {
    Field::<Deployment, Option<Vec<TopologySpreadConstraint>>>::new(
        "topology-spread-constraints",
        |d| pod_spec(d).map(|p| &p.topology_spread_constraints),
        |d| &mut pod_spec_mut(d).topology_spread_constraints,
    )
}

/// Engine-owned `spec.replicas`. Leave out of the pipeline when an autoscaler
/// owns the field.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicasSync;

impl Mutator<Deployment> for ReplicasSync {
    fn name(&self) -> &str {
        "replicas"
    }

    fn mutate(&self, desired: &Deployment, existing: &mut Deployment) -> bool {
        replicas().sync().mutate(desired, existing)
    }
}

/// Per-container `resources`, paired by container name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerResourcesSync;

impl Mutator<Deployment> for ContainerResourcesSync {
    fn name(&self) -> &str {
        "container-resources"
    }

    fn mutate(&self, desired: &Deployment, existing: &mut Deployment) -> bool {
        for_each_container_pair(desired, existing, |want, have| {
            if want.resources == have.resources {
                return false;
            }
            have.resources = want.resources.clone();
            true
        })
    }
}

/// Syncs only the named environment variables; every other entry on the live
/// container is left as is. A name the desired container lacks is removed.
#[derive(Debug, Clone)]
pub struct EnvSync {
    name: &'static str,
    vars: Vec<String>,
}

impl EnvSync {
    pub fn new(name: &'static str, vars: &[&str]) -> Self {
        Self { name, vars: vars.iter().map(|v| v.to_string()).collect() }
    }
}

fn sync_env_var(want: Option<&EnvVar>, env: &mut Option<Vec<EnvVar>>, name: &str) -> bool {
    let pos = env.as_ref().and_then(|vars| vars.iter().position(|e| e.name == name));
    match (want, pos) {
        (Some(w), Some(i)) => match env.as_mut() {
            Some(vars) if vars[i] != *w => {
                vars[i] = w.clone();
                true
            }
            _ => false,
        },
        (Some(w), None) => {
            env.get_or_insert_with(Vec::new).push(w.clone());
            true
        }
        (None, Some(i)) => {
            if let Some(vars) = env.as_mut() {
                vars.remove(i);
            }
            true
        }
        (None, None) => false,
    }
}

impl Mutator<Deployment> for EnvSync {
    fn name(&self) -> &str {
        self.name
    }

    fn mutate(&self, desired: &Deployment, existing: &mut Deployment) -> bool {
        for_each_container_pair(desired, existing, |want, have| {
            let mut changed = false;
            for var in &self.vars {
                let w = want.env.as_ref().and_then(|env| env.iter().find(|e| &e.name == var));
                changed |= sync_env_var(w, &mut have.env, var);
            }
            changed
        })
    }
}

/// Container launch arguments, replaced wholesale when they differ.
#[derive(Debug, Clone)]
pub struct ArgsSync {
    name: &'static str,
}

impl ArgsSync {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Mutator<Deployment> for ArgsSync {
    fn name(&self) -> &str {
        self.name
    }

    fn mutate(&self, desired: &Deployment, existing: &mut Deployment) -> bool {
        for_each_container_pair(desired, existing, |want, have| {
            if want.args == have.args {
                return false;
            }
            have.args = want.args.clone();
            true
        })
    }
}

/// Generic multi-field sync for workloads: labels, scheduling and resources.
pub fn workload_generic() -> MultiFieldSync<Deployment> {
    MultiFieldSync::new("workload-generic")
        .field(object_labels())
        .field(pod_template_labels())
        .field(affinity())
        .field(tolerations())
        .field(priority_class_name())
        .field(topology_spread_constraints())
        .with(ContainerResourcesSync)
}

/// Base pipeline every backend workload gets, before optional members.
pub fn generic_workload_pipeline() -> Pipeline<Deployment> {
    Pipeline::new().with(workload_generic())
}
