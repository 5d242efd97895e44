//! Ownership annotations on the owning APIManager.
//!
//! Each key revokes engine ownership of one field group. Only presence is
//! tested; the value is never read.

use crate::Annotations;

/// External actor owns `spec.replicas` of the backend listener.
pub const BACKEND_LISTENER_REPLICAS: &str = "apps.3scale.net/disable-backend-listener-replica-reconciler";
/// External actor owns `spec.replicas` of the backend worker.
pub const BACKEND_WORKER_REPLICAS: &str = "apps.3scale.net/disable-backend-worker-replica-reconciler";
/// External actor owns `spec.replicas` of the backend cron.
pub const BACKEND_CRON_REPLICAS: &str = "apps.3scale.net/disable-backend-cron-replica-reconciler";

/// True when `key` is present in `annotations`, whatever its value.
pub fn has_override(annotations: Option<&Annotations>, key: &str) -> bool {
    annotations.map(|a| a.contains_key(key)).unwrap_or(false)
}
