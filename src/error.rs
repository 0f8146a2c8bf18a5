//! Error types for the App Operator

use std::time::Duration;

use crate::store::StoreError;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cluster store error, propagated unchanged from the store client
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A computed object broke a structural invariant (e.g. a selector that
    /// does not match its own pod template). Never retried.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A Deployment with the managed name is controlled by another object.
    /// Never retried; the App waits for a change.
    #[error("Workload not owned: {0}")]
    WorkloadNotOwned(String),

    /// The reconcile call exceeded its deadline
    #[error("Reconcile timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same reconcile can never succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_) | Error::WorkloadNotOwned(_) | Error::ConfigError(_)
        )
    }
}
