//! AMP in-RAM object store: a versioned map keyed by `ResourceId` with the
//! same optimistic-concurrency contract as the API server.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use amp_core::{Error, Object, ObjectStore, ResourceId, Result};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Update,
}

struct Entry {
    version: u64,
    raw: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ResourceId, Entry>,
    next_version: u64,
    writes: u64,
    faults: Vec<(StoreOp, ResourceId)>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Consume a pending fault for `(op, id)`, if any.
    fn take_fault(&mut self, op: StoreOp, id: &ResourceId) -> Option<Error> {
        let idx = self.faults.iter().position(|(o, i)| *o == op && i == id)?;
        self.faults.remove(idx);
        Some(Error::Transient(format!("injected {:?} failure for {}", op, id)))
    }
}

/// Objects are stored serialized, so every read hands out an independent copy.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed or overwrite an object directly, bypassing faults and version checks.
    pub fn insert<K: Object>(&self, obj: &K) -> Result<u64> {
        let id = ResourceId::of(obj);
        let raw = serde_json::to_value(obj)?;
        let mut inner = self.lock();
        let version = inner.bump();
        inner.objects.insert(id, Entry { version, raw });
        Ok(version)
    }

    /// Make the next `op` on `id` fail with a transient store error.
    pub fn fail_next(&self, op: StoreOp, id: ResourceId) {
        self.lock().faults.push((op, id));
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.lock().objects.contains_key(id)
    }

    pub fn version_of(&self, id: &ResourceId) -> Option<u64> {
        self.lock().objects.get(id).map(|e| e.version)
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful creates and updates so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }
}

fn decode<K: Object>(entry: &Entry) -> Result<K> {
    let mut obj: K = serde_json::from_value(entry.raw.clone())?;
    obj.meta_mut().resource_version = Some(entry.version.to_string());
    Ok(obj)
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<K> {
        let mut inner = self.lock();
        if let Some(e) = inner.take_fault(StoreOp::Get, id) {
            return Err(e);
        }
        match inner.objects.get(id) {
            Some(entry) => decode(entry),
            None => Err(Error::NotFound(id.clone())),
        }
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let id = ResourceId::of(obj);
        let raw = serde_json::to_value(obj)?;
        let mut inner = self.lock();
        if let Some(e) = inner.take_fault(StoreOp::Create, &id) {
            return Err(e);
        }
        if inner.objects.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        let version = inner.bump();
        inner.writes += 1;
        debug!(%id, version, "created");
        let entry = Entry { version, raw };
        let out = decode(&entry);
        inner.objects.insert(id, entry);
        out
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let id = ResourceId::of(obj);
        let raw = serde_json::to_value(obj)?;
        let mut inner = self.lock();
        if let Some(e) = inner.take_fault(StoreOp::Update, &id) {
            return Err(e);
        }
        let current = match inner.objects.get(&id) {
            Some(entry) => entry.version,
            None => return Err(Error::NotFound(id)),
        };
        let seen = obj.meta().resource_version.as_deref().and_then(|rv| rv.parse::<u64>().ok());
        if seen != Some(current) {
            return Err(Error::Conflict(id));
        }
        let version = inner.bump();
        inner.writes += 1;
        debug!(%id, from = current, to = version, "updated");
        let entry = Entry { version, raw };
        let out = decode(&entry);
        inner.objects.insert(id, entry);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cm(name: &str, v: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() },
            data: Some(BTreeMap::from([("k".to_string(), v.to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemStore::new();
        let res: Result<ConfigMap> = store.get(&ResourceId::new("ConfigMap", "ns", "a")).await;
        assert!(res.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn create_then_duplicate_create_fails() {
        let store = MemStore::new();
        let created = store.create(&cm("a", "1")).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        let err = store.create(&cm("a", "2")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn stale_update_is_a_conflict() {
        let store = MemStore::new();
        store.create(&cm("a", "1")).await.unwrap();
        let id = ResourceId::new("ConfigMap", "ns", "a");
        let mut first: ConfigMap = store.get(&id).await.unwrap();
        let mut second: ConfigMap = store.get(&id).await.unwrap();

        first.data = Some(BTreeMap::from([("k".to_string(), "first".to_string())]));
        store.update(&first).await.unwrap();

        second.data = Some(BTreeMap::from([("k".to_string(), "second".to_string())]));
        let err = store.update(&second).await.unwrap_err();
        assert!(err.is_conflict());

        let live: ConfigMap = store.get(&id).await.unwrap();
        assert_eq!(live.data.unwrap()["k"], "first");
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let store = MemStore::new();
        let id = ResourceId::new("ConfigMap", "ns", "a");
        store.fail_next(StoreOp::Create, id.clone());
        assert!(matches!(store.create(&cm("a", "1")).await, Err(Error::Transient(_))));
        assert!(!store.contains(&id));
        store.create(&cm("a", "1")).await.unwrap();
        assert!(store.contains(&id));
    }

    #[tokio::test]
    async fn reads_are_independent_copies() {
        let store = MemStore::new();
        store.insert(&cm("a", "1")).unwrap();
        let id = ResourceId::new("ConfigMap", "ns", "a");
        let mut copy: ConfigMap = store.get(&id).await.unwrap();
        copy.data = None;
        let again: ConfigMap = store.get(&id).await.unwrap();
        assert!(again.data.is_some());
    }
}
