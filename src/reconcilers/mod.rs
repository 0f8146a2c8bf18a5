//! Reconciliation logic for App resources

pub mod app;

pub use app::{AppReconciler, ReconcileAction, ReconcileOutcome, CLEANUP_FINALIZER};

use std::time::Duration;

/// How the managed Deployment is removed once its App is deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DeletionPolicy {
    /// The Deployment carries a controller owner reference and the cluster
    /// garbage collector removes it. The reconciler takes no action.
    #[default]
    OwnerReference,
    /// The reconciler holds a finalizer on the App and deletes the
    /// Deployment itself before releasing it.
    Explicit,
}

/// Tunables for [`AppReconciler`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerOptions {
    pub deletion_policy: DeletionPolicy,
    /// Requeue delay returned for live Apps, `None` to wait for the next event
    pub resync_interval: Option<Duration>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            deletion_policy: DeletionPolicy::default(),
            resync_interval: Some(Duration::from_secs(300)),
        }
    }
}
