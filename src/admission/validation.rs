//! Validation for App resources
//!
//! Every check is a pure function of the object(s) under admission.

use std::collections::BTreeSet;

use kube::ResourceExt;
use tracing::info;

use super::Rejection;
use crate::crd::App;

/// Longest App name that still fits in the `app=<name>` label value
pub const MAX_APP_NAME_LEN: usize = 63;

impl App {
    /// Validate an App on creation
    pub fn validate_create(&self) -> Result<(), Rejection> {
        info!(name = %self.name_any(), "validate create");
        validate_spec(self)
    }

    /// Validate an App on update. `old` is the currently persisted object.
    pub fn validate_update(&self, old: &App) -> Result<(), Rejection> {
        info!(
            name = %self.name_any(),
            old_generation = old.metadata.generation.unwrap_or_default(),
            "validate update"
        );
        validate_spec(self)
    }

    /// Validate an App on deletion. Deletion is never refused.
    pub fn validate_delete(&self) -> Result<(), Rejection> {
        info!(name = %self.name_any(), "validate delete");
        Ok(())
    }
}

fn validate_spec(app: &App) -> Result<(), Rejection> {
    validate_name(&app.name_any())?;

    let template = &app.spec.workload_template;

    if let Some(replicas) = template.replicas {
        if replicas < 0 {
            return Err(Rejection::new(format!(
                "spec.workloadTemplate.replicas must be >= 0, got {}",
                replicas
            )));
        }
    }

    let containers = template
        .template
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    if containers.is_empty() {
        return Err(Rejection::new(
            "spec.workloadTemplate.template.spec.containers must declare at least one container",
        ));
    }

    let mut seen = BTreeSet::new();
    for (i, container) in containers.iter().enumerate() {
        if container.name.is_empty() {
            return Err(Rejection::new(format!(
                "spec.workloadTemplate.template.spec.containers[{}].name cannot be empty",
                i
            )));
        }
        if !seen.insert(container.name.as_str()) {
            return Err(Rejection::new(format!(
                "duplicate container name \"{}\" in spec.workloadTemplate.template.spec.containers",
                container.name
            )));
        }
    }

    Ok(())
}

/// The name becomes the value of the `app` selector label, so it must be a
/// valid label value.
fn validate_name(name: &str) -> Result<(), Rejection> {
    if name.is_empty() {
        return Err(Rejection::new("metadata.name cannot be empty"));
    }

    if name.len() > MAX_APP_NAME_LEN {
        return Err(Rejection::new(format!(
            "metadata.name must be at most {} characters to be used as a label value",
            MAX_APP_NAME_LEN
        )));
    }

    let bytes = name.as_bytes();
    let edges_ok = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    let body_ok = bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

    if !edges_ok || !body_ok {
        return Err(Rejection::new(format!(
            "metadata.name \"{}\" is not a valid label value: use alphanumerics, '-', '_' or '.', \
             beginning and ending with an alphanumeric character",
            name
        )));
    }

    Ok(())
}
