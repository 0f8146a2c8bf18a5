//! AdmissionReview handling for the App hooks
//!
//! Pure functions from a review request to a response. Transport lives in
//! the parent module.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::admission::SidecarPolicy;
use crate::crd::App;

/// Path of the mutating (defaulting) hook
pub const MUTATE_PATH: &str = "/mutate-app-o0w0o-cn-v1-app";

/// Path of the validating hook
pub const VALIDATE_PATH: &str = "/validate-app-o0w0o-cn-v1-app";

/// The two admission hooks served for Apps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    Mutate,
    Validate,
}

impl Hook {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            MUTATE_PATH => Some(Hook::Mutate),
            VALIDATE_PATH => Some(Hook::Validate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Mutate => "mutate",
            Hook::Validate => "validate",
        }
    }
}

/// Answer a raw AdmissionReview body for `hook`
pub fn respond(hook: Hook, body: &[u8], sidecar: &SidecarPolicy) -> AdmissionResponse {
    match parse_request(body) {
        Ok(request) => match hook {
            Hook::Mutate => mutate(&request, sidecar),
            Hook::Validate => validate(&request),
        },
        Err(response) => response,
    }
}

/// Decode an AdmissionReview carrying Apps
pub fn parse_request(body: &[u8]) -> Result<AdmissionRequest<App>, AdmissionResponse> {
    let review: AdmissionReview<App> = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Failed to decode admission review");
        AdmissionResponse::invalid(format!("invalid admission review: {}", e))
    })?;

    let request: Result<AdmissionRequest<App>, _> = review.try_into();
    request.map_err(|e| {
        warn!(error = %e, "Admission review carries no request");
        AdmissionResponse::invalid(e.to_string())
    })
}

/// Mutating hook: apply App defaulting and return it as a JSON patch
pub fn mutate(request: &AdmissionRequest<App>, sidecar: &SidecarPolicy) -> AdmissionResponse {
    let Some(app) = request.object.as_ref() else {
        debug!(uid = %request.uid, "No object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let patch = match defaulting_patch(app, sidecar) {
        Ok(patch) => patch,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Failed to compute defaulting patch");
            return AdmissionResponse::from(request).deny(format!("defaulting failed: {}", e));
        }
    };

    if patch.0.is_empty() {
        return AdmissionResponse::from(request);
    }

    info!(
        uid = %request.uid,
        name = %app.name_any(),
        patch_ops = patch.0.len(),
        "Applying defaults to App"
    );

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {}", e))
        }
    }
}

/// JSON patch turning `app` into its defaulted form. Empty when defaulting
/// changes nothing.
pub fn defaulting_patch(app: &App, sidecar: &SidecarPolicy) -> serde_json::Result<json_patch::Patch> {
    let mut defaulted = app.clone();
    defaulted.apply_defaults(sidecar);

    let before = serde_json::to_value(app)?;
    let after = serde_json::to_value(&defaulted)?;
    Ok(json_patch::diff(&before, &after))
}

/// Validating hook: run the validation matching the request operation
pub fn validate(request: &AdmissionRequest<App>) -> AdmissionResponse {
    let verdict = match request.operation {
        Operation::Create => request.object.as_ref().map(App::validate_create),
        Operation::Update => match (request.object.as_ref(), request.old_object.as_ref()) {
            (Some(new), Some(old)) => Some(new.validate_update(old)),
            _ => None,
        },
        Operation::Delete => request.old_object.as_ref().map(App::validate_delete),
        Operation::Connect => Some(Ok(())),
    };

    match verdict {
        Some(Ok(())) => AdmissionResponse::from(request),
        Some(Err(rejection)) => {
            info!(
                uid = %request.uid,
                name = %request.name,
                reason = rejection.reason(),
                "Rejected App"
            );
            AdmissionResponse::from(request).deny(rejection.reason())
        }
        None => AdmissionResponse::from(request).deny(format!(
            "{:?} review for {} carries no App object",
            request.operation, request.name
        )),
    }
}
