//! AMP kubehub: the API-server backed object store and client bootstrap.

#![forbid(unsafe_code)]

use amp_core::{Error, Object, ObjectStore, ResourceId, Result};
use kube::api::{Api, PostParams};
use kube::Client;
use metrics::counter;
use tracing::{debug, warn};

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    debug!("kube client ready");
    Ok(client)
}

/// Map an API failure for `id` onto the store error taxonomy.
///
/// `on_conflict` picks the meaning of HTTP 409: already-exists on create, a
/// stale resourceVersion on update.
fn classify(id: &ResourceId, err: kube::Error, on_conflict: fn(ResourceId) -> Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(id.clone()),
        kube::Error::Api(resp) if resp.code == 409 => on_conflict(id.clone()),
        kube::Error::SerdeError(e) => Error::Serialization(e),
        other => {
            counter!("kube_store_errors_total", 1, "kind" => id.kind.clone());
            warn!(%id, error = %other, "api request failed");
            Error::Transient(other.to_string())
        }
    }
}

/// [`ObjectStore`] over a live API server. Every call is one request; there
/// is no caching and no retry.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<K> {
        self.api::<K>(&id.namespace).get(&id.name).await.map_err(|e| classify(id, e, Error::Conflict))
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let id = ResourceId::of(obj);
        debug!(%id, "create");
        self.api::<K>(&id.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(&id, e, Error::AlreadyExists))
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let id = ResourceId::of(obj);
        debug!(%id, "replace");
        self.api::<K>(&id.namespace)
            .replace(&id.name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(&id, e, Error::Conflict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: "x".into(), code })
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        let id = ResourceId::new("Secret", "amp", "backend-redis");
        assert!(matches!(classify(&id, api_error(404), Error::Conflict), Error::NotFound(_)));
        assert!(matches!(classify(&id, api_error(409), Error::AlreadyExists), Error::AlreadyExists(_)));
        assert!(matches!(classify(&id, api_error(409), Error::Conflict), Error::Conflict(_)));
        assert!(matches!(classify(&id, api_error(500), Error::Conflict), Error::Transient(_)));
    }
}
