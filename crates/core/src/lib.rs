//! AMP core types: resource identity, reconcile outcomes, errors and the
//! object store contract shared by the engine and its backends.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod annotations;

pub use annotations::has_override;

/// Anything the engine can read from and write to the object store.
///
/// All managed kinds are namespaced and statically typed (`DynamicType = ()`).
pub trait Object:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Object for T where
    T: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// `(kind, namespace, name)`; unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    /// Identity of a typed object, taken from its kind and metadata.
    pub fn of<K: Object>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            kind: K::kind(&()).into_owned(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Identity for kind `K` at `namespace/name` without needing an instance.
    pub fn for_kind<K: Object>(namespace: &str, name: &str) -> Self {
        Self::new(K::kind(&()).into_owned(), namespace, name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Per-resource result of one reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(ResourceId),
    #[error("already exists: {0}")]
    AlreadyExists(ResourceId),
    #[error("conflict: {0} was modified concurrently")]
    Conflict(ResourceId),
    #[error("store: {0}")]
    Transient(String),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object Store Client: get/create/update against a versioned store keyed by
/// [`ResourceId`].
///
/// Implementations hand out owned copies; nothing returned aliases store state.
/// `update` must reject a stale `resourceVersion` with [`Error::Conflict`].
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<K>;
    async fn create<K: Object>(&self, obj: &K) -> Result<K>;
    async fn update<K: Object>(&self, obj: &K) -> Result<K>;
}

/// Annotation map as carried on object metadata.
pub type Annotations = BTreeMap<String, String>;
