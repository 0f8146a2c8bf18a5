//! Custom Resource Definitions for the App Operator

mod app;

pub use app::*;

use kube::CustomResourceExt;

/// Generate CRD YAML manifests for all custom resources
pub fn generate_crds() -> serde_yaml::Result<Vec<String>> {
    Ok(vec![serde_yaml::to_string(&App::crd())?])
}
