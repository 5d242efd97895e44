//! Generic reconcile-kind primitive: get → (create | mutate → update iff changed).
//!
//! No retries here. Conflicts and store failures go back to the caller, whose
//! control loop re-runs the whole pass on the next trigger.

use std::future::Future;

use amp_core::{Error, Object, ObjectStore, Outcome, ResourceId, Result};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mutator::Pipeline;

/// Race a store call against cancellation. A cancelled call is dropped before
/// its result is observed, so no partial local mutation is written back.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Converge one resource toward `desired`.
///
/// `desired` is only read; mutators write into a private copy of the live
/// object fetched from `store`.
pub async fn reconcile_kind<K, S>(
    store: &S,
    cancel: &CancellationToken,
    desired: &K,
    pipeline: &Pipeline<K>,
) -> Result<Outcome>
where
    K: Object,
    S: ObjectStore,
{
    let id = ResourceId::of(desired);
    let res = converge(store, cancel, &id, desired, pipeline).await;
    match &res {
        Ok(outcome) => {
            counter!("reconcile_outcomes_total", 1, "kind" => id.kind.clone(), "outcome" => outcome.as_str());
            match outcome {
                Outcome::Unchanged => debug!(kind = %id.kind, ns = %id.namespace, name = %id.name, "unchanged"),
                _ => info!(kind = %id.kind, ns = %id.namespace, name = %id.name, outcome = %outcome, "reconciled"),
            }
        }
        Err(Error::Cancelled) => debug!(%id, "reconcile cancelled"),
        Err(e) => {
            counter!("reconcile_errors_total", 1, "kind" => id.kind.clone());
            warn!(%id, error = %e, "reconcile failed");
        }
    }
    res
}

async fn converge<K, S>(
    store: &S,
    cancel: &CancellationToken,
    id: &ResourceId,
    desired: &K,
    pipeline: &Pipeline<K>,
) -> Result<Outcome>
where
    K: Object,
    S: ObjectStore,
{
    let mut existing: K = match guarded(cancel, store.get(id)).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            guarded(cancel, store.create(desired)).await?;
            return Ok(Outcome::Created);
        }
        Err(e) => return Err(e),
    };

    if !pipeline.apply(desired, &mut existing) {
        return Ok(Outcome::Unchanged);
    }
    debug!(%id, mutators = ?pipeline.names(), "drift detected; updating");
    guarded(cancel, store.update(&existing)).await?;
    Ok(Outcome::Updated)
}

/// Store plus cancellation scope for one reconciliation pass.
pub struct Reconciler<'a, S> {
    store: &'a S,
    cancel: CancellationToken,
}

impl<'a, S: ObjectStore> Reconciler<'a, S> {
    pub fn new(store: &'a S, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn reconcile<K: Object>(&self, desired: &K, pipeline: &Pipeline<K>) -> Result<Outcome> {
        reconcile_kind(self.store, &self.cancel, desired, pipeline).await
    }

    /// Cancellable lookup for reads that feed desired-state decisions.
    pub async fn get<K: Object>(&self, id: &ResourceId) -> Result<K> {
        guarded(&self.cancel, self.store.get(id)).await
    }
}
