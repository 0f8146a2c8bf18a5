//! App Custom Resource Definition

use k8s_openapi::api::apps::v1::DeploymentSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the App resource
pub const APP_GROUP: &str = "app.o0w0o.cn";

/// App resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "app.o0w0o.cn",
    version = "v1",
    kind = "App",
    plural = "apps",
    singular = "app",
    shortname = "app",
    namespaced,
    status = "AppStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.workloadTemplate.replicas"}"#,
    printcolumn = r#"{"name": "Workload", "type": "string", "jsonPath": ".status.workloadName"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Deployment template projected into the managed `<name>-deploy`
    /// Deployment. Its selector is always overwritten with `app=<name>`.
    pub workload_template: DeploymentSpec,
}

/// App status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Generation of the spec last projected into the workload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the managed Deployment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,
}
