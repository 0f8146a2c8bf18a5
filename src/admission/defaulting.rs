//! Defaulting for App resources

use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::ResourceExt;
use tracing::info;

use crate::crd::App;

pub const DEFAULT_SIDECAR_NAME: &str = "sidecar-nginx";
pub const DEFAULT_SIDECAR_IMAGE: &str = "nginx:1.12.2";

/// Sidecar container injected into every App's pod template
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarPolicy {
    pub name: String,
    pub image: String,
}

impl Default for SidecarPolicy {
    fn default() -> Self {
        Self {
            name: DEFAULT_SIDECAR_NAME.to_string(),
            image: DEFAULT_SIDECAR_IMAGE.to_string(),
        }
    }
}

impl SidecarPolicy {
    fn container(&self) -> Container {
        Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            ..Default::default()
        }
    }
}

impl App {
    /// Fill in defaults before the App is persisted.
    ///
    /// Appends the policy sidecar unless a container with the same name is
    /// already present, so applying defaults any number of times yields the
    /// same container list.
    pub fn apply_defaults(&mut self, sidecar: &SidecarPolicy) {
        info!(
            namespace = %self.namespace().unwrap_or_default(),
            name = %self.name_any(),
            "default"
        );

        let pod_spec = self
            .spec
            .workload_template
            .template
            .spec
            .get_or_insert_with(PodSpec::default);

        if pod_spec.containers.iter().any(|c| c.name == sidecar.name) {
            return;
        }
        pod_spec.containers.push(sidecar.container());
    }
}
