//! App Kubernetes Operator
//!
//! Main entry point for the operator. Parses configuration, sets up the
//! Kubernetes client, and runs the controller alongside the metrics and
//! admission webhook servers.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use app_operator::{
    config::{LogFormat, OperatorConfig},
    controllers::{app_controller, backoff::KeyedBackoff, Context},
    metrics,
    reconcilers::AppReconciler,
    store::KubeStore,
    webhook::{self, WebhookState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();
    init_tracing(config.log_format);
    config.validate()?;

    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        deletion_policy = ?config.deletion_policy,
        "Starting App Operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();
    let reconciler = AppReconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        config.reconciler_options(),
    );
    let context = Context::new(
        client,
        reconciler,
        KeyedBackoff::new(config.backoff_config()),
        config.reconcile_timeout(),
        shutdown.clone(),
    );

    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    let webhook_handle = if config.disable_webhook {
        warn!("Admission webhook disabled");
        None
    } else {
        let tls = match config.webhook_cert_dir.as_deref() {
            Some(dir) => Some(webhook::load_tls(dir)?),
            None => {
                warn!("No webhook certificate directory configured, serving plain HTTP");
                None
            }
        };
        let state = Arc::new(WebhookState::new(config.sidecar_policy()));
        Some(tokio::spawn(webhook::serve(config.webhook_port, state, tls)))
    };

    let controller_handle = tokio::spawn(app_controller::run(context, config.namespace.clone()));

    let webhook_exit = async {
        match webhook_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = controller_handle => {
            info!("App controller exited");
        }
        res = metrics_handle => {
            error!("Metrics server exited unexpectedly: {:?}", res);
        }
        res = webhook_exit => {
            error!("Admission webhook exited unexpectedly: {:?}", res);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    shutdown.cancel();
    info!("App Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_operator=debug,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
