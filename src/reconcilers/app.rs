//! Reconciler converging a managed Deployment toward its App

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::ReconcilerOptions;
use crate::adapters::deployment_builder::{
    build_deployment, foreign_controller, merge_managed_metadata, workload_key,
    workload_spec_matches,
};
use crate::crd::App;
use crate::store::{NamespacedName, Store, StoreError, StoreResult};
use crate::{Error, Result};

/// Finalizer held on Apps under [`super::DeletionPolicy::Explicit`]
pub const CLEANUP_FINALIZER: &str = "app.o0w0o.cn/workload-cleanup";

/// What a single reconcile did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The App no longer exists
    AppGone,
    /// The App is being deleted and nothing is left for this controller to do
    AppDeleting,
    /// The App is being deleted and its Deployment was removed
    CleanedUp,
    /// The Deployment was missing and has been created
    Created,
    /// The Deployment had drifted and has been overwritten
    Updated,
    /// The Deployment already matched
    Unchanged,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::AppGone => "app_gone",
            ReconcileAction::AppDeleting => "app_deleting",
            ReconcileAction::CleanedUp => "cleaned_up",
            ReconcileAction::Created => "created",
            ReconcileAction::Updated => "updated",
            ReconcileAction::Unchanged => "unchanged",
        }
    }
}

/// Result of a successful reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: ReconcileAction,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn finished(action: ReconcileAction) -> Self {
        Self {
            action,
            requeue_after: None,
        }
    }
}

/// Reconciler for App resources.
///
/// Stateless apart from its store handle: every call re-reads the App and
/// the Deployment, so it is safe to run concurrently for different keys.
/// Callers must serialize calls for the same key.
#[derive(Clone)]
pub struct AppReconciler {
    store: Arc<dyn Store>,
    options: ReconcilerOptions,
}

impl AppReconciler {
    pub fn new(store: Arc<dyn Store>, options: ReconcilerOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    /// Converge the Deployment of the App at `key`.
    ///
    /// Store errors are returned unchanged and never retried here. Every
    /// store call gives up with [`StoreError::Cancelled`] once `cancel` fires.
    #[instrument(skip_all, fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(
        &self,
        key: &NamespacedName,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let app = match guarded(cancel, self.store.get_app(key)).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => {
                debug!("App not found, nothing to reconcile");
                return Ok(ReconcileOutcome::finished(ReconcileAction::AppGone));
            }
            Err(e) => {
                error!(error = %e, "Failed to get App");
                return Err(e.into());
            }
        };

        if app.metadata.deletion_timestamp.is_some() {
            return self.finalize(&app, cancel).await;
        }

        let app = self.ensure_finalizer(app, cancel).await?;
        let desired = build_deployment(&app, self.options.deletion_policy)?;
        let workload = workload_key(&app);

        let action = match guarded(cancel, self.store.get_workload(&workload)).await {
            Err(e) if e.is_not_found() => {
                info!(workload = %workload, "Deployment not found, creating");
                guarded(cancel, self.store.create_workload(&desired)).await?;
                ReconcileAction::Created
            }
            Err(e) => {
                error!(workload = %workload, error = %e, "Failed to get Deployment");
                return Err(e.into());
            }
            Ok(mut found) => {
                if let Some(owner) = foreign_controller(&found, &app) {
                    return Err(Error::WorkloadNotOwned(format!(
                        "Deployment {} is controlled by {} {}",
                        workload, owner.kind, owner.name
                    )));
                }

                let metadata_drifted = merge_managed_metadata(&mut found, &desired);
                let desired_spec = desired.spec.unwrap_or_default();
                let spec_matches = found
                    .spec
                    .as_ref()
                    .is_some_and(|observed| workload_spec_matches(observed, &desired_spec));

                if spec_matches && !metadata_drifted {
                    debug!(workload = %workload, "Deployment up to date");
                    ReconcileAction::Unchanged
                } else {
                    info!(
                        workload = %workload,
                        spec_drifted = !spec_matches,
                        metadata_drifted,
                        "Deployment drifted, updating"
                    );
                    found.spec = Some(desired_spec);
                    guarded(cancel, self.store.update_workload(&found)).await?;
                    ReconcileAction::Updated
                }
            }
        };

        Ok(ReconcileOutcome {
            action,
            requeue_after: self.options.resync_interval,
        })
    }

    /// Handle an App carrying a deletion marker.
    ///
    /// Only Apps holding [`CLEANUP_FINALIZER`] need work; everything else is
    /// left to owner-reference garbage collection.
    async fn finalize(&self, app: &App, cancel: &CancellationToken) -> Result<ReconcileOutcome> {
        if !app.finalizers().iter().any(|f| f == CLEANUP_FINALIZER) {
            info!("App is being deleted, Deployment is left to garbage collection");
            return Ok(ReconcileOutcome::finished(ReconcileAction::AppDeleting));
        }

        let workload = workload_key(app);
        match guarded(cancel, self.store.get_workload(&workload)).await {
            Ok(found) => {
                if let Some(owner) = foreign_controller(&found, app) {
                    warn!(
                        workload = %workload,
                        owner_kind = %owner.kind,
                        owner_name = %owner.name,
                        "Deployment is controlled by another object, leaving it in place"
                    );
                } else {
                    match guarded(cancel, self.store.delete_workload(&workload)).await {
                        Ok(()) => info!(workload = %workload, "Deleted Deployment of deleted App"),
                        Err(e) if e.is_not_found() => {
                            debug!(workload = %workload, "Deployment already gone")
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Err(e) if e.is_not_found() => debug!(workload = %workload, "Deployment already gone"),
            Err(e) => return Err(e.into()),
        }

        let remaining = app
            .finalizers()
            .iter()
            .filter(|f| *f != CLEANUP_FINALIZER)
            .cloned()
            .collect();
        guarded(cancel, self.store.set_app_finalizers(app, remaining)).await?;
        info!("Released cleanup finalizer");

        Ok(ReconcileOutcome::finished(ReconcileAction::CleanedUp))
    }

    /// Under explicit deletion, make sure the App cannot disappear before its
    /// Deployment has been removed.
    async fn ensure_finalizer(&self, app: App, cancel: &CancellationToken) -> Result<App> {
        if self.options.deletion_policy != super::DeletionPolicy::Explicit
            || app.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
        {
            return Ok(app);
        }

        let mut finalizers = app.finalizers().to_vec();
        finalizers.push(CLEANUP_FINALIZER.to_string());
        debug!("Adding cleanup finalizer");
        Ok(guarded(cancel, self.store.set_app_finalizers(&app, finalizers)).await?)
    }
}

/// Run a store call unless the reconcile is cancelled first
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = call => res,
    }
}
