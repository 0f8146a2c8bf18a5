//! Exponential backoff keyed by reconcile key

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::store::NamespacedName;

/// Backoff bounds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
        }
    }
}

/// Tracks consecutive failures per key and doubles the retry delay for each
pub struct KeyedBackoff {
    config: BackoffConfig,
    failures: Mutex<HashMap<NamespacedName, u32>>,
}

impl KeyedBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &NamespacedName) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry(key.clone()).or_insert(0);
        let exponent = (*attempt).min(31);
        *attempt = attempt.saturating_add(1);

        self.config
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.config.max, |d| d.min(self.config.max))
    }

    /// Forget the failures of `key` after a successful reconcile
    pub fn reset(&self, key: &NamespacedName) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn failures(&self, key: &NamespacedName) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
