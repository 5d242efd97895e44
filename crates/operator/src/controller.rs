//! kube-runtime control loop over `APIManager` objects.

use std::sync::Arc;

use amp_core::{Error, ResourceId};
use amp_kubehub::KubeStore;
use amp_schema::APIManager;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendReconciler;
use crate::config::OperatorConfig;
use crate::locks::PassLocks;

pub struct Context {
    store: KubeStore,
    locks: PassLocks,
    cancel: CancellationToken,
    config: OperatorConfig,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, cancel: CancellationToken) -> Self {
        Self { store: KubeStore::new(client), locks: PassLocks::new(), cancel, config }
    }
}

async fn reconcile(am: Arc<APIManager>, ctx: Arc<Context>) -> Result<Action, Error> {
    let id = ResourceId::of(am.as_ref());
    let _pass = ctx.locks.acquire(&id).await;
    let report = BackendReconciler::new(&ctx.store, ctx.cancel.child_token(), &am).reconcile().await?;
    debug!(%id, created = report.count(amp_core::Outcome::Created), updated = report.count(amp_core::Outcome::Updated), "pass report");
    Ok(Action::requeue(ctx.config.resync()))
}

/// Invalid specs wait for the next `APIManager` change; everything else
/// retries after the configured backoff.
fn requeue_after_error(err: &Error, config: &OperatorConfig) -> Action {
    match err {
        Error::InvalidSpec(_) => Action::await_change(),
        _ => Action::requeue(config.error_backoff()),
    }
}

fn error_policy(am: Arc<APIManager>, err: &Error, ctx: Arc<Context>) -> Action {
    let id = ResourceId::of(am.as_ref());
    match err {
        Error::InvalidSpec(_) => warn!(%id, error = %err, "APIManager is invalid; waiting for a spec change"),
        _ => warn!(%id, error = %err, backoff_secs = ctx.config.error_backoff_secs, "pass failed; requeueing"),
    }
    requeue_after_error(err, &ctx.config)
}

/// Drive passes until `cancel` fires. In-flight passes see the same token and
/// stop at their next store call.
pub async fn run(client: Client, config: OperatorConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let (managers, deployments): (Api<APIManager>, Api<Deployment>) = match &config.watch_namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };
    info!(namespace = ?config.watch_namespace, resync_secs = config.resync_secs, "controller starting");

    let shutdown = cancel.clone();
    let ctx = Arc::new(Context::new(client, config, cancel));
    Controller::new(managers, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(name = %obj.name, ns = ?obj.namespace, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile attempt failed"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
