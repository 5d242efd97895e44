//! Annotation-driven mutator selection.
//!
//! An ownership annotation on the owning spec drops exactly one field-owning
//! mutator from one resource's pipeline. Everything else in the pipeline is
//! kept. Selection is evaluated per resource on every pass.

use amp_core::{has_override, Annotations};
use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use crate::mutator::{Mutator, Pipeline};
use crate::workload::ReplicasSync;

/// `base` plus `owned`, unless `key` is present in `annotations`.
pub fn select_mutators<K: 'static>(
    annotations: Option<&Annotations>,
    key: &str,
    mut base: Pipeline<K>,
    owned: impl Mutator<K> + 'static,
) -> Pipeline<K> {
    if has_override(annotations, key) {
        debug!(annotation = %key, mutator = owned.name(), "field group owned externally; mutator omitted");
    } else {
        base.push(owned);
    }
    base
}

/// Workload pipeline with [`ReplicasSync`] gated on `key`.
pub fn replicas_unless_overridden(
    annotations: Option<&Annotations>,
    key: &str,
    base: Pipeline<Deployment>,
) -> Pipeline<Deployment> {
    select_mutators(annotations, key, base, ReplicasSync)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::generic_workload_pipeline;
    use amp_core::annotations::{BACKEND_LISTENER_REPLICAS, BACKEND_WORKER_REPLICAS};

    #[test]
    fn annotation_omits_replicas_only() {
        let annotations = Annotations::from([(BACKEND_LISTENER_REPLICAS.to_string(), "true".to_string())]);
        let p = replicas_unless_overridden(Some(&annotations), BACKEND_LISTENER_REPLICAS, generic_workload_pipeline());
        assert!(!p.contains("replicas"));
        assert!(p.contains("workload-generic"));
    }

    #[test]
    fn absent_annotation_includes_replicas() {
        let p = replicas_unless_overridden(None, BACKEND_LISTENER_REPLICAS, generic_workload_pipeline());
        assert_eq!(p.names(), vec!["workload-generic", "replicas"]);
    }

    #[test]
    fn keys_are_independent_per_resource() {
        let annotations = Annotations::from([(BACKEND_WORKER_REPLICAS.to_string(), String::new())]);
        let listener = replicas_unless_overridden(Some(&annotations), BACKEND_LISTENER_REPLICAS, Pipeline::new());
        let worker = replicas_unless_overridden(Some(&annotations), BACKEND_WORKER_REPLICAS, Pipeline::new());
        assert!(listener.contains("replicas"));
        assert!(!worker.contains("replicas"));
    }
}
