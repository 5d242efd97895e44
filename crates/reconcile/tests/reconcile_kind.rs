#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use amp_core::annotations::BACKEND_LISTENER_REPLICAS;
use amp_core::{Annotations, Error, Object, ObjectStore, Outcome, ResourceId, Result};
use amp_reconcile::{
    reconcile_kind, replicas_unless_overridden, workload, CreateOnly, Mutator, Pipeline, Reconciler, ReplicasSync,
};
use amp_store::{MemStore, StoreOp};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::Service;
use kube::api::ObjectMeta;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn workload_obj(replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta { name: Some("backend-listener".into()), namespace: Some("amp".into()), ..Default::default() },
        spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
        ..Default::default()
    }
}

fn listener_id() -> ResourceId {
    ResourceId::new("Deployment", "amp", "backend-listener")
}

async fn live_replicas(store: &MemStore) -> Option<i32> {
    let d: Deployment = store.get(&listener_id()).await.unwrap();
    d.spec.and_then(|s| s.replicas)
}

fn replicas_pipeline() -> Pipeline<Deployment> {
    Pipeline::new().with(ReplicasSync)
}

#[tokio::test]
async fn fresh_create() {
    let store = MemStore::new();
    let cancel = CancellationToken::new();
    let out = reconcile_kind(&store, &cancel, &workload_obj(3), &replicas_pipeline()).await.unwrap();
    assert_eq!(out, Outcome::Created);
    assert_eq!(live_replicas(&store).await, Some(3));
}

#[tokio::test]
async fn converged_object_is_not_written() {
    let store = MemStore::new();
    let cancel = CancellationToken::new();
    let desired = workload_obj(3);
    reconcile_kind(&store, &cancel, &desired, &replicas_pipeline()).await.unwrap();
    let version = store.version_of(&listener_id());

    for _ in 0..3 {
        let out = reconcile_kind(&store, &cancel, &desired, &replicas_pipeline()).await.unwrap();
        assert_eq!(out, Outcome::Unchanged);
    }
    assert_eq!(store.writes(), 1);
    assert_eq!(store.version_of(&listener_id()), version);
}

#[tokio::test]
async fn drift_is_corrected_once() {
    let store = MemStore::new();
    store.insert(&workload_obj(5)).unwrap();
    let cancel = CancellationToken::new();
    let desired = workload_obj(2);

    let out = reconcile_kind(&store, &cancel, &desired, &replicas_pipeline()).await.unwrap();
    assert_eq!(out, Outcome::Updated);
    assert_eq!(live_replicas(&store).await, Some(2));

    let out = reconcile_kind(&store, &cancel, &desired, &replicas_pipeline()).await.unwrap();
    assert_eq!(out, Outcome::Unchanged);
}

#[tokio::test]
async fn create_only_keeps_first_version() {
    let store = MemStore::new();
    let cancel = CancellationToken::new();
    let svc = |port_name: &str| Service {
        metadata: ObjectMeta {
            name: Some("backend-listener".into()),
            namespace: Some("amp".into()),
            labels: Some(BTreeMap::from([("port".to_string(), port_name.to_string())])),
            ..Default::default()
        },
        ..Default::default()
    };
    let p = Pipeline::new().with(CreateOnly);
    assert_eq!(reconcile_kind(&store, &cancel, &svc("http"), &p).await.unwrap(), Outcome::Created);
    for name in ["https", "grpc", "other"] {
        assert_eq!(reconcile_kind(&store, &cancel, &svc(name), &p).await.unwrap(), Outcome::Unchanged);
    }
    let live: Service = store.get(&ResourceId::new("Service", "amp", "backend-listener")).await.unwrap();
    assert_eq!(live.metadata.labels.unwrap()["port"], "http");
}

#[tokio::test]
async fn autoscaler_coexistence() {
    let store = MemStore::new();
    store.insert(&workload_obj(5)).unwrap();
    let cancel = CancellationToken::new();
    let desired = workload_obj(2);

    let mut annotations = Annotations::from([(BACKEND_LISTENER_REPLICAS.to_string(), "true".to_string())]);
    let p = replicas_unless_overridden(Some(&annotations), BACKEND_LISTENER_REPLICAS, workload::generic_workload_pipeline());
    assert_eq!(reconcile_kind(&store, &cancel, &desired, &p).await.unwrap(), Outcome::Unchanged);
    assert_eq!(live_replicas(&store).await, Some(5));

    annotations.remove(BACKEND_LISTENER_REPLICAS);
    let p = replicas_unless_overridden(Some(&annotations), BACKEND_LISTENER_REPLICAS, workload::generic_workload_pipeline());
    assert_eq!(reconcile_kind(&store, &cancel, &desired, &p).await.unwrap(), Outcome::Updated);
    assert_eq!(live_replicas(&store).await, Some(2));
    assert_eq!(reconcile_kind(&store, &cancel, &desired, &p).await.unwrap(), Outcome::Unchanged);
}

#[tokio::test]
async fn concurrent_conflict_is_surfaced() {
    let store = MemStore::new();
    store.insert(&workload_obj(1)).unwrap();

    // Two passes fetched the same live object.
    let mut first: Deployment = store.get(&listener_id()).await.unwrap();
    let mut second: Deployment = store.get(&listener_id()).await.unwrap();

    assert!(ReplicasSync.mutate(&workload_obj(3), &mut first));
    assert!(ReplicasSync.mutate(&workload_obj(4), &mut second));

    store.update(&first).await.unwrap();
    let err = store.update(&second).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(live_replicas(&store).await, Some(3));
}

#[tokio::test]
async fn store_failures_are_surfaced_unmodified() {
    let store = MemStore::new();
    let cancel = CancellationToken::new();
    store.fail_next(StoreOp::Get, listener_id());
    let err = reconcile_kind(&store, &cancel, &workload_obj(1), &replicas_pipeline()).await.unwrap_err();
    assert!(matches!(err, Error::Transient(_)));
    assert!(!store.contains(&listener_id()), "non-NotFound lookup failures must not fall through to create");

    store.fail_next(StoreOp::Create, listener_id());
    let err = reconcile_kind(&store, &cancel, &workload_obj(1), &replicas_pipeline()).await.unwrap_err();
    assert!(matches!(err, Error::Transient(_)));

    assert_eq!(reconcile_kind(&store, &cancel, &workload_obj(1), &replicas_pipeline()).await.unwrap(), Outcome::Created);
}

#[tokio::test]
async fn failed_update_leaves_store_untouched() {
    let store = MemStore::new();
    store.insert(&workload_obj(5)).unwrap();
    let cancel = CancellationToken::new();
    store.fail_next(StoreOp::Update, listener_id());
    assert!(reconcile_kind(&store, &cancel, &workload_obj(2), &replicas_pipeline()).await.is_err());
    assert_eq!(live_replicas(&store).await, Some(5));
}

#[tokio::test]
async fn cancelled_pass_writes_nothing() {
    let store = MemStore::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let r = Reconciler::new(&store, cancel);
    let err = r.reconcile(&workload_obj(1), &replicas_pipeline()).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(store.is_empty());
}

/// MemStore whose `held` operation parks until released, so a test can act
/// while that call is in flight.
struct HeldStore {
    inner: MemStore,
    held: StoreOp,
    reached: Notify,
    release: Notify,
}

impl HeldStore {
    fn new(held: StoreOp) -> Self {
        Self { inner: MemStore::new(), held, reached: Notify::new(), release: Notify::new() }
    }

    async fn hold(&self, op: StoreOp) {
        if op == self.held {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for HeldStore {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<K> {
        self.hold(StoreOp::Get).await;
        self.inner.get(id).await
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        self.hold(StoreOp::Create).await;
        self.inner.create(obj).await
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        self.hold(StoreOp::Update).await;
        self.inner.update(obj).await
    }
}

#[tokio::test]
async fn cancel_during_update_drops_the_write() {
    let store = HeldStore::new(StoreOp::Update);
    store.inner.insert(&workload_obj(5)).unwrap();
    let cancel = CancellationToken::new();

    let (desired, pipeline) = (workload_obj(2), replicas_pipeline());
    let pass = reconcile_kind(&store, &cancel, &desired, &pipeline);
    let shutdown = async {
        store.reached.notified().await;
        cancel.cancel();
    };
    let (res, ()) = tokio::join!(pass, shutdown);

    assert!(matches!(res, Err(Error::Cancelled)));
    assert_eq!(store.inner.writes(), 0);
    assert_eq!(live_replicas(&store.inner).await, Some(5));
}

#[tokio::test]
async fn cancel_during_lookup_skips_create() {
    let store = HeldStore::new(StoreOp::Get);
    let cancel = CancellationToken::new();

    let (desired, pipeline) = (workload_obj(2), replicas_pipeline());
    let pass = reconcile_kind(&store, &cancel, &desired, &pipeline);
    let shutdown = async {
        store.reached.notified().await;
        cancel.cancel();
    };
    let (res, ()) = tokio::join!(pass, shutdown);

    assert!(matches!(res, Err(Error::Cancelled)));
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn concurrent_write_during_update_is_a_conflict() {
    let store = HeldStore::new(StoreOp::Update);
    store.inner.insert(&workload_obj(5)).unwrap();
    let cancel = CancellationToken::new();

    let (desired, pipeline) = (workload_obj(2), replicas_pipeline());
    let pass = reconcile_kind(&store, &cancel, &desired, &pipeline);
    let other_writer = async {
        store.reached.notified().await;
        let mut live: Deployment = store.inner.get(&listener_id()).await.unwrap();
        live.spec.as_mut().unwrap().replicas = Some(7);
        store.inner.update(&live).await.unwrap();
        store.release.notify_one();
    };
    let (res, ()) = tokio::join!(pass, other_writer);

    assert!(matches!(res, Err(Error::Conflict(_))));
    assert_eq!(store.inner.writes(), 1);
    assert_eq!(live_replicas(&store.inner).await, Some(7));
}
