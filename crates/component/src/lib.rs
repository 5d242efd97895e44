//! AMP components: desired-state builders.
//!
//! Builders are pure: the same options always yield the same objects. Options
//! are derived from the owning `APIManager` plus the live state they depend on,
//! and validated up front, so object construction itself cannot fail. The one
//! exception is the internal API password: when no live secret holds one, a
//! new random value is generated.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use amp_core::{Error, Result};
use amp_schema::{APIManager, BackendComponentSpec};
use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Secret, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub mod backend;

pub use backend::Backend;

pub const DEFAULT_BACKEND_IMAGE: &str = "quay.io/3scale/apisonator:latest";
pub const INTERNAL_API_USERNAME: &str = "3scale_api_user";

/// Resolved settings for one backend subcomponent.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentOptions {
    pub replicas: i32,
    pub resources: ResourceRequirements,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendOptions {
    pub namespace: String,
    pub image: String,
    pub tenant_name: String,
    pub wildcard_domain: String,
    /// Separate queue and storage redis instances.
    pub redis_async: bool,
    pub listener: ComponentOptions,
    pub worker: ComponentOptions,
    pub cron: ComponentOptions,
    pub internal_api_username: String,
    pub internal_api_password: String,
}

fn requirements(req_cpu: &str, req_mem: &str, lim_cpu: &str, lim_mem: &str) -> ResourceRequirements {
    let q = |cpu: &str, mem: &str| {
        BTreeMap::from([("cpu".to_string(), Quantity(cpu.to_string())), ("memory".to_string(), Quantity(mem.to_string()))])
    };
    ResourceRequirements { requests: Some(q(req_cpu, req_mem)), limits: Some(q(lim_cpu, lim_mem)), ..Default::default() }
}

fn component(
    name: &str,
    spec: Option<BackendComponentSpec>,
    enabled: bool,
    defaults: ResourceRequirements,
) -> Result<ComponentOptions> {
    let spec = spec.unwrap_or_default();
    let replicas = spec.replicas.unwrap_or(1);
    if replicas < 0 {
        return Err(Error::InvalidSpec(format!("backend {} replicas must not be negative (got {})", name, replicas)));
    }
    // An empty requirements object matches what the API server echoes back.
    let resources = match (enabled, spec.resources) {
        (false, _) => ResourceRequirements::default(),
        (true, Some(r)) => r,
        (true, None) => defaults,
    };
    Ok(ComponentOptions {
        replicas,
        resources,
        affinity: spec.affinity,
        tolerations: spec.tolerations,
        priority_class_name: spec.priority_class_name,
    })
}

impl BackendOptions {
    /// Resolve options for the backend of `am`. `redis_async` comes from the
    /// live `backend-redis` secret, see [`redis_async_enabled`]. Credentials in
    /// the live `backend-internal-api` secret are reused when present.
    pub fn from_apimanager(am: &APIManager, redis_async: bool, internal_api: Option<&Secret>) -> Result<Self> {
        let namespace = am
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| Error::InvalidSpec("APIManager has no namespace".into()))?;
        let wildcard_domain = am.spec.wildcard_domain.trim().to_string();
        if wildcard_domain.is_empty() {
            return Err(Error::InvalidSpec("spec.wildcardDomain is required".into()));
        }
        if wildcard_domain.contains(char::is_whitespace) || wildcard_domain.starts_with('.') {
            return Err(Error::InvalidSpec(format!("spec.wildcardDomain {:?} is not a DNS domain", wildcard_domain)));
        }
        let enabled = am.spec.resource_requirements_enabled.unwrap_or(true);
        let backend = am.backend();
        Ok(Self {
            namespace,
            image: backend.image.unwrap_or_else(|| DEFAULT_BACKEND_IMAGE.to_string()),
            tenant_name: am.tenant_name().to_string(),
            wildcard_domain,
            redis_async,
            listener: component("listener", backend.listener_spec, enabled, requirements("500m", "550Mi", "1", "700Mi"))?,
            worker: component("worker", backend.worker_spec, enabled, requirements("150m", "50Mi", "1", "300Mi"))?,
            cron: component("cron", backend.cron_spec, enabled, requirements("50m", "40Mi", "150m", "80Mi"))?,
            internal_api_username: secret_value(internal_api, "username")
                .unwrap_or_else(|| INTERNAL_API_USERNAME.to_string()),
            internal_api_password: secret_value(internal_api, "password")
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        })
    }
}

/// Reads `key` from `data`, or from `stringData` when the store has not folded it yet.
fn secret_value(secret: Option<&Secret>, key: &str) -> Option<String> {
    let secret = secret?;
    let from_data = secret.data.as_ref().and_then(|d| d.get(key)).map(|raw| String::from_utf8_lossy(&raw.0).into_owned());
    from_data
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).cloned())
        .filter(|v| !v.is_empty())
}

/// Async mode is on when the queues and storage redis URLs point at different
/// instances once their default DB suffixes (`1` and `0`) are stripped.
/// A missing secret or missing keys read as non-async.
pub fn redis_async_enabled(secret: Option<&Secret>) -> bool {
    let Some(data) = secret.and_then(|s| s.data.as_ref()) else {
        return false;
    };
    let get = |k: &str| data.get(k).map(|v| String::from_utf8_lossy(&v.0).into_owned()).unwrap_or_default();
    let queues = get("REDIS_QUEUES_URL");
    let storage = get("REDIS_STORAGE_URL");
    queues.strip_suffix('1').unwrap_or(&queues) != storage.strip_suffix('0').unwrap_or(&storage)
}
