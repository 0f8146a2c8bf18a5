//! Controller for App resources

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Api, ResourceExt,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::deployment_builder::{owning_app, APP_LABEL};
use crate::controllers::Context;
use crate::crd::App;
use crate::metrics::prometheus::{
    RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS, WORKLOAD_WRITES,
};
use crate::reconcilers::ReconcileAction;
use crate::store::NamespacedName;
use crate::Error;

/// Run the App controller until shutdown.
///
/// Watches Apps and the Deployments labelled `app`, mapping Deployment
/// events back to the owning App so out-of-band edits are corrected.
pub async fn run(ctx: Arc<Context>, namespace: Option<String>) {
    let client = ctx.client.clone();
    let (apps, deployments): (Api<App>, Api<Deployment>) = match namespace.as_deref() {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    info!(namespace = namespace.as_deref().unwrap_or("*"), "Starting App controller");

    let backoff_ctx = ctx.clone();
    Controller::new(apps, Config::default().any_semantic())
        .watches(deployments, Config::default().labels(APP_LABEL), |deployment| {
            owning_app(&deployment).map(|key| ObjectRef::new(&key.name).within(&key.namespace))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            let ctx = backoff_ctx.clone();
            async move {
                match res {
                    Ok(o) => info!("Reconciled {:?}", o),
                    Err(e) => {
                        // A retry scheduled for an App deleted in the meantime
                        // never reaches reconcile, so its failure count ends here.
                        if let Some(key) = missing_key(&e) {
                            debug!("App {} is gone, dropping its backoff", key);
                            ctx.backoff.reset(&key);
                        } else {
                            warn!("Reconcile failed: {:?}", e);
                        }
                    }
                }
            }
        })
        .await;

    info!("App controller stopped");
}

/// Reconcile an App.
///
/// The watched object only supplies the key; the reconciler re-reads current
/// state because events for the same key may arrive out of order.
#[instrument(skip(app, ctx), fields(name = %app.name_any(), namespace = %app.namespace().unwrap_or_default()))]
async fn reconcile(app: Arc<App>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = std::time::Instant::now();
    let key = NamespacedName::of(app.as_ref());

    RECONCILIATIONS.with_label_values(&["App"]).inc();

    let cancel = ctx.shutdown.child_token();
    let result = match tokio::time::timeout(
        ctx.reconcile_timeout,
        ctx.reconciler.reconcile(&key, &cancel),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(Error::Timeout(ctx.reconcile_timeout))
        }
    };

    let duration = start.elapsed().as_secs_f64();
    RECONCILE_DURATION
        .with_label_values(&["App"])
        .observe(duration);

    match result {
        Ok(outcome) => {
            ctx.backoff.reset(&key);
            if matches!(
                outcome.action,
                ReconcileAction::Created | ReconcileAction::Updated | ReconcileAction::CleanedUp
            ) {
                WORKLOAD_WRITES
                    .with_label_values(&[outcome.action.as_str()])
                    .inc();
            }
            info!(
                action = outcome.action.as_str(),
                "Successfully reconciled {} in {:.2}s", key, duration
            );
            Ok(outcome
                .requeue_after
                .map_or_else(Action::await_change, Action::requeue))
        }
        Err(e) => {
            RECONCILIATION_ERRORS.with_label_values(&["App"]).inc();
            Err(e)
        }
    }
}

/// Error policy for the controller.
///
/// Retryable errors back off exponentially per key. Fatal errors wait for
/// the App to change instead of retrying.
fn error_policy(app: Arc<App>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = NamespacedName::of(app.as_ref());

    if err.is_fatal() {
        error!("Reconciliation of {} failed permanently: {}", key, err);
        return Action::await_change();
    }

    let delay = ctx.backoff.next_delay(&key);
    match err {
        Error::Store(e) if e.is_conflict() => {
            info!("Conflict reconciling {}, retrying in {:?}: {}", key, delay, e)
        }
        _ => error!("Reconciliation error for {}, retrying in {:?}: {}", key, delay, err),
    }
    Action::requeue(delay)
}

/// Key of an App that was scheduled for reconcile but is no longer cached
fn missing_key<ReconcilerErr, QueueErr>(
    err: &controller::Error<ReconcilerErr, QueueErr>,
) -> Option<NamespacedName>
where
    ReconcilerErr: std::error::Error + 'static,
    QueueErr: std::error::Error + 'static,
{
    match err {
        controller::Error::ObjectNotFound(obj) => Some(NamespacedName::new(
            obj.namespace.clone().unwrap_or_default(),
            obj.name.clone(),
        )),
        _ => None,
    }
}
