//! Narrow client interface to the cluster state store
//!
//! The reconciler only ever talks to the cluster through [`Store`], which keeps
//! it independent of the kube client and lets tests run against
//! [`MemoryStore`].

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, StoreOperation, WriteRecord};

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use crate::crd::App;

/// Result type for store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Namespace/name identity of a namespaced object, used as the reconcile key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing namespaced resource
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors returned by a [`Store`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist. Drives create-vs-update and tombstone handling.
    #[error("{kind} {key} not found")]
    NotFound {
        kind: &'static str,
        key: NamespacedName,
    },

    /// Optimistic concurrency failure or name collision
    #[error("conflict on {kind} {key}: {message}")]
    Conflict {
        kind: &'static str,
        key: NamespacedName,
        message: String,
    },

    /// Any other Kubernetes API failure
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// The call was abandoned because its reconcile was cancelled
    #[error("store call cancelled")]
    Cancelled,

    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Classify a kube client error for the given object
    pub fn from_kube(kind: &'static str, key: &NamespacedName, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
                kind,
                key: key.clone(),
            },
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
                kind,
                key: key.clone(),
                message: resp.message,
            },
            other => StoreError::Kube(other),
        }
    }
}

/// Operations the reconciler needs from the cluster store.
///
/// Implementations must not retry internally; every failure is returned to
/// the caller so the controller runner's backoff governs retries.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch an App by key
    async fn get_app(&self, key: &NamespacedName) -> StoreResult<App>;

    /// Replace the finalizer list of an App, guarded by its resourceVersion
    async fn set_app_finalizers(&self, app: &App, finalizers: Vec<String>) -> StoreResult<App>;

    /// Fetch a managed Deployment by key
    async fn get_workload(&self, key: &NamespacedName) -> StoreResult<Deployment>;

    /// Create a managed Deployment
    async fn create_workload(&self, workload: &Deployment) -> StoreResult<Deployment>;

    /// Replace a managed Deployment. The object's resourceVersion is the
    /// optimistic concurrency precondition.
    async fn update_workload(&self, workload: &Deployment) -> StoreResult<Deployment>;

    /// Delete a managed Deployment
    async fn delete_workload(&self, key: &NamespacedName) -> StoreResult<()>;
}
