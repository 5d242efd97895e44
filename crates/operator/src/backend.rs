//! Backend component reconciler.

use std::time::Instant;

use amp_component::backend::{self as desired, INTERNAL_API_SECRET, REDIS_SECRET};
use amp_component::{redis_async_enabled, Backend, BackendOptions};
use amp_core::annotations::{BACKEND_CRON_REPLICAS, BACKEND_LISTENER_REPLICAS, BACKEND_WORKER_REPLICAS};
use amp_core::{Annotations, Error, Object, ObjectStore, ResourceId, Result};
use amp_reconcile::{catalog, replicas_unless_overridden, workload, ArgsSync, CreateOnly, EnvSync, Pipeline, Reconciler};
use amp_schema::APIManager;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::PassReport;

/// Runs one backend pass for one `APIManager`.
///
/// Steps run strictly in order; the first failing step ends the pass and its
/// error is returned. Resources converged before the failure stay converged.
pub struct BackendReconciler<'a, S> {
    rec: Reconciler<'a, S>,
    am: &'a APIManager,
}

impl<'a, S: ObjectStore> BackendReconciler<'a, S> {
    pub fn new(store: &'a S, cancel: CancellationToken, am: &'a APIManager) -> Self {
        Self { rec: Reconciler::new(store, cancel), am }
    }

    fn annotations(&self) -> Option<&Annotations> {
        self.am.metadata.annotations.as_ref()
    }

    pub async fn reconcile(&self) -> Result<PassReport> {
        let pass = Uuid::new_v4();
        let span = info_span!(
            "backend_pass",
            %pass,
            ns = self.am.metadata.namespace.as_deref().unwrap_or_default(),
            name = self.am.metadata.name.as_deref().unwrap_or_default(),
        );
        let started = Instant::now();
        let res = self.run().instrument(span.clone()).await;
        histogram!("backend_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        span.in_scope(|| match &res {
            Ok(report) => {
                counter!("backend_pass_total", 1, "result" => "ok");
                info!(steps = report.len(), converged = report.converged(), "backend pass complete");
            }
            Err(Error::Cancelled) => {
                counter!("backend_pass_total", 1, "result" => "cancelled");
                debug!("backend pass cancelled");
            }
            Err(e) => {
                counter!("backend_pass_total", 1, "result" => "error");
                warn!(error = %e, "backend pass failed");
            }
        });
        res
    }

    /// Live secret `name`, or `None` when it does not exist yet.
    async fn live_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let id = ResourceId::for_kind::<Secret>(namespace, name);
        match self.rec.get::<Secret>(&id).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.is_not_found() => {
                debug!(%id, "secret absent");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run(&self) -> Result<PassReport> {
        let namespace = self
            .am
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::InvalidSpec("APIManager has no namespace".into()))?;
        let redis_async = redis_async_enabled(self.live_secret(&namespace, REDIS_SECRET).await?.as_ref());
        let internal_api = self.live_secret(&namespace, INTERNAL_API_SECRET).await?;
        let backend = Backend::new(BackendOptions::from_apimanager(self.am, redis_async, internal_api.as_ref())?);
        let owner = self.am.controller_owner_ref(&());
        let mut pass = Pass { rec: &self.rec, owner, report: PassReport::default() };
        let ann = self.annotations();

        pass.step(backend.cron_deployment(), replicas_unless_overridden(ann, BACKEND_CRON_REPLICAS, workload::generic_workload_pipeline())).await?;
        pass.step(backend.listener_deployment(), self.listener_pipeline(redis_async)).await?;
        pass.step(backend.listener_service(), Pipeline::new().with(CreateOnly)).await?;
        pass.step(backend.listener_route(), Pipeline::new().with(CreateOnly)).await?;
        pass.step(backend.worker_deployment(), self.worker_pipeline(redis_async)).await?;
        pass.step(backend.environment_config_map(), Pipeline::new().with(CreateOnly)).await?;
        pass.step(backend.internal_api_secret(), Pipeline::new().with(catalog::secret_defaults())).await?;
        pass.step(backend.listener_secret(), Pipeline::new().with(catalog::secret_defaults())).await?;
        pass.step(backend.worker_pdb(), Pipeline::new().with(catalog::pdb_generic())).await?;
        pass.step(backend.cron_pdb(), Pipeline::new().with(catalog::pdb_generic())).await?;
        pass.step(backend.listener_pdb(), Pipeline::new().with(catalog::pdb_generic())).await?;
        pass.step(backend.worker_pod_monitor(), Pipeline::new().with(CreateOnly)).await?;
        pass.step(backend.listener_pod_monitor(), Pipeline::new().with(CreateOnly)).await?;
        pass.step(backend.grafana_dashboard(), Pipeline::new().with(catalog::dashboard_generic())).await?;
        pass.step(backend.worker_prometheus_rules(), Pipeline::new().with(CreateOnly)).await?;
        pass.step(backend.listener_prometheus_rules(), Pipeline::new().with(CreateOnly)).await?;

        Ok(pass.report)
    }

    fn listener_pipeline(&self, redis_async: bool) -> Pipeline<Deployment> {
        let mut p = replicas_unless_overridden(self.annotations(), BACKEND_LISTENER_REPLICAS, workload::generic_workload_pipeline());
        if redis_async {
            p.push(EnvSync::new("listener-env", desired::LISTENER_ASYNC_ENV));
            p.push(ArgsSync::new("listener-args"));
        }
        p
    }

    fn worker_pipeline(&self, redis_async: bool) -> Pipeline<Deployment> {
        let mut p = replicas_unless_overridden(self.annotations(), BACKEND_WORKER_REPLICAS, workload::generic_workload_pipeline());
        if redis_async {
            p.push(EnvSync::new("worker-env", desired::WORKER_ASYNC_ENV));
        }
        p
    }
}

struct Pass<'r, 'a, S> {
    rec: &'r Reconciler<'a, S>,
    owner: Option<OwnerReference>,
    report: PassReport,
}

impl<S: ObjectStore> Pass<'_, '_, S> {
    async fn step<K: Object>(&mut self, mut obj: K, pipeline: Pipeline<K>) -> Result<()> {
        if let Some(owner) = &self.owner {
            obj.meta_mut().owner_references = Some(vec![owner.clone()]);
        }
        let id = ResourceId::of(&obj);
        let outcome = self.rec.reconcile(&obj, &pipeline).await?;
        self.report.record(id, outcome);
        Ok(())
    }
}
