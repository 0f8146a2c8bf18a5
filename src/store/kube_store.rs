//! [`Store`] backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::{NamespacedName, Store, StoreError, StoreResult};
use crate::crd::App;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "app-operator";

/// Store client talking to the API server through kube
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apps(&self, namespace: &str) -> Api<App> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_app(&self, key: &NamespacedName) -> StoreResult<App> {
        self.apps(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube("App", key, e))
    }

    async fn set_app_finalizers(&self, app: &App, finalizers: Vec<String>) -> StoreResult<App> {
        let key = NamespacedName::of(app);
        // resourceVersion in a merge patch turns it into a conditional write
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": app.resource_version(),
            }
        });
        debug!(namespace = %key.namespace, name = %key.name, "Patching App finalizers");

        self.apps(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| StoreError::from_kube("App", &key, e))
    }

    async fn get_workload(&self, key: &NamespacedName) -> StoreResult<Deployment> {
        self.deployments(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube("Deployment", key, e))
    }

    async fn create_workload(&self, workload: &Deployment) -> StoreResult<Deployment> {
        let key = NamespacedName::of(workload);
        self.deployments(&key.namespace)
            .create(&Self::post_params(), workload)
            .await
            .map_err(|e| StoreError::from_kube("Deployment", &key, e))
    }

    async fn update_workload(&self, workload: &Deployment) -> StoreResult<Deployment> {
        let key = NamespacedName::of(workload);
        self.deployments(&key.namespace)
            .replace(&key.name, &Self::post_params(), workload)
            .await
            .map_err(|e| StoreError::from_kube("Deployment", &key, e))
    }

    async fn delete_workload(&self, key: &NamespacedName) -> StoreResult<()> {
        self.deployments(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube("Deployment", key, e))
    }
}
