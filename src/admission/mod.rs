//! Admission pipeline for App writes
//!
//! Defaulting runs first (mutating hook), then validation (validating hook).
//! Both are synchronous and stateless; the webhook server in
//! [`crate::webhook`] is only transport around them.

mod defaulting;
mod validation;

pub use defaulting::{SidecarPolicy, DEFAULT_SIDECAR_IMAGE, DEFAULT_SIDECAR_NAME};
pub use validation::MAX_APP_NAME_LEN;

/// A refused App write. The reason is returned to the client verbatim.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Rejection {
    reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
