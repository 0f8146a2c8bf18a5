//! Controller implementations for watching and reconciling resources

pub mod app_controller;
pub mod backoff;

use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::reconcilers::AppReconciler;
use backoff::KeyedBackoff;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler invoked for every App key
    pub reconciler: AppReconciler,
    /// Per-key retry delays
    pub backoff: KeyedBackoff,
    /// Deadline for a single reconcile call
    pub reconcile_timeout: Duration,
    /// Cancelled when the operator shuts down
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        reconciler: AppReconciler,
        backoff: KeyedBackoff,
        reconcile_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            reconciler,
            backoff,
            reconcile_timeout,
            shutdown,
        })
    }
}
