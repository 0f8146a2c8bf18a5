//! Operator configuration
//!
//! Every setting is a command-line flag with an environment variable
//! fallback, so the same binary runs from a shell or a Deployment manifest.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::admission::{SidecarPolicy, DEFAULT_SIDECAR_IMAGE, DEFAULT_SIDECAR_NAME};
use crate::controllers::backoff::BackoffConfig;
use crate::reconcilers::{DeletionPolicy, ReconcilerOptions};
use crate::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Kubernetes operator reconciling App resources into Deployments
#[derive(Clone, Debug, Parser)]
#[command(name = "app-operator", version, about)]
pub struct OperatorConfig {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Port serving /metrics and health probes
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Port serving the admission webhook
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 9443)]
    pub webhook_port: u16,

    /// Directory holding tls.crt and tls.key for the webhook. Plain HTTP when unset.
    #[arg(long, env = "WEBHOOK_CERT_DIR")]
    pub webhook_cert_dir: Option<PathBuf>,

    /// Do not start the admission webhook server
    #[arg(long, env = "DISABLE_WEBHOOK")]
    pub disable_webhook: bool,

    /// How managed Deployments are removed when their App is deleted
    #[arg(long, env = "DELETION_POLICY", value_enum, default_value_t = DeletionPolicy::OwnerReference)]
    pub deletion_policy: DeletionPolicy,

    /// Name of the sidecar container injected by defaulting
    #[arg(long, env = "SIDECAR_NAME", default_value = DEFAULT_SIDECAR_NAME)]
    pub sidecar_name: String,

    /// Image of the sidecar container injected by defaulting
    #[arg(long, env = "SIDECAR_IMAGE", default_value = DEFAULT_SIDECAR_IMAGE)]
    pub sidecar_image: String,

    /// Periodic resync of live Apps in seconds, 0 to only react to events
    #[arg(long, env = "RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Deadline for a single reconcile in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// Retry delay after the first failed reconcile, in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry delay, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Reject settings the operator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "reconcile timeout must be greater than 0".to_string(),
            ));
        }

        let backoff = self.backoff_config();
        if backoff.base.is_zero() {
            return Err(Error::ConfigError(
                "backoff base must be greater than 0".to_string(),
            ));
        }
        if backoff.base > backoff.max {
            return Err(Error::ConfigError(format!(
                "backoff base ({:?}) exceeds backoff max ({:?})",
                backoff.base, backoff.max
            )));
        }

        if self.sidecar_name.is_empty() || self.sidecar_image.is_empty() {
            return Err(Error::ConfigError(
                "sidecar name and image cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn sidecar_policy(&self) -> SidecarPolicy {
        SidecarPolicy {
            name: self.sidecar_name.clone(),
            image: self.sidecar_image.clone(),
        }
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            deletion_policy: self.deletion_policy,
            resync_interval: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> OperatorConfig {
        OperatorConfig::try_parse_from(std::iter::once("app-operator").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_match_derived_types() {
        let config = parse(&[]);
        config.validate().unwrap();

        assert_eq!(config.sidecar_policy(), SidecarPolicy::default());
        assert_eq!(config.reconciler_options(), ReconcilerOptions::default());
        assert_eq!(config.backoff_config(), BackoffConfig::default());
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(30));
        assert!(config.webhook_cert_dir.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--namespace",
            "apps",
            "--deletion-policy",
            "explicit",
            "--sidecar-image",
            "nginx:1.27",
            "--resync-secs",
            "0",
            "--log-format",
            "text",
        ]);

        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.sidecar_policy().image, "nginx:1.27");

        let options = config.reconciler_options();
        assert_eq!(options.deletion_policy, DeletionPolicy::Explicit);
        assert_eq!(options.resync_interval, None);
    }

    #[test]
    fn invalid_timing_is_rejected() {
        let zero_timeout = parse(&["--reconcile-timeout-secs", "0"]);
        assert!(matches!(zero_timeout.validate(), Err(Error::ConfigError(_))));

        let inverted = parse(&["--backoff-base-ms", "10000", "--backoff-max-secs", "5"]);
        assert!(matches!(inverted.validate(), Err(Error::ConfigError(_))));
    }
}
