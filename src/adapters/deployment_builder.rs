//! Projection of an App into its managed Deployment

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::App;
use crate::reconcilers::DeletionPolicy;
use crate::store::NamespacedName;
use crate::{Error, Result};

/// Suffix appended to the App name to name its Deployment
pub const WORKLOAD_SUFFIX: &str = "-deploy";

/// Label carried by the Deployment, its selector and its pod template
pub const APP_LABEL: &str = "app";

pub fn workload_name(app_name: &str) -> String {
    format!("{}{}", app_name, WORKLOAD_SUFFIX)
}

/// Identity of the Deployment managed for `app`
pub fn workload_key(app: &App) -> NamespacedName {
    NamespacedName::new(
        app.namespace().unwrap_or_default(),
        workload_name(&app.name_any()),
    )
}

pub fn build_labels(app_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), app_name.to_string());
    labels
}

/// Compute the Deployment spec for an App.
///
/// The template is copied as-is, then the selector is replaced by
/// `app=<name>` and the same label is merged into the pod template so the
/// selector always matches the pods it governs.
pub fn desired_spec(app: &App) -> DeploymentSpec {
    let labels = build_labels(&app.name_any());
    let mut spec = app.spec.workload_template.clone();

    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };

    spec.template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels);

    spec
}

/// Build the full Deployment for an App
pub fn build_deployment(app: &App, policy: DeletionPolicy) -> Result<Deployment> {
    let name = app.name_any();
    let key = workload_key(app);
    let spec = desired_spec(app);

    if !selector_matches_template(&spec) {
        return Err(Error::InvariantViolation(format!(
            "selector of Deployment {} does not match its pod template",
            key
        )));
    }

    let owner_references = match policy {
        DeletionPolicy::OwnerReference => Some(vec![build_owner_reference(app)]),
        DeletionPolicy::Explicit => None,
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(key.name),
            namespace: Some(key.namespace),
            labels: Some(build_labels(&name)),
            owner_references,
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

/// Whether the selector is non-empty, label-only, and satisfied by the pod
/// template labels
pub fn selector_matches_template(spec: &DeploymentSpec) -> bool {
    if spec
        .selector
        .match_expressions
        .as_ref()
        .is_some_and(|e| !e.is_empty())
    {
        return false;
    }

    let Some(match_labels) = spec.selector.match_labels.as_ref().filter(|l| !l.is_empty()) else {
        return false;
    };

    let template_labels = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.as_ref());

    match_labels
        .iter()
        .all(|(k, v)| template_labels.and_then(|l| l.get(k)) == Some(v))
}

/// Field-by-field comparison of an observed Deployment spec with the desired
/// one. Destructuring without `..` makes a new upstream field a compile error
/// here instead of a silently unreconciled difference.
///
/// Fields the API server defaults on write (`strategy`,
/// `revisionHistoryLimit`, container `imagePullPolicy`, ...) are compared
/// like any other, so an App leaving them unset never matches a
/// server-defaulted Deployment and is rewritten on every reconcile. Zero
/// writes on a repeated reconcile only hold when the observed spec carries
/// no server-side defaults beyond what the App declares.
pub fn workload_spec_matches(observed: &DeploymentSpec, desired: &DeploymentSpec) -> bool {
    let DeploymentSpec {
        min_ready_seconds,
        paused,
        progress_deadline_seconds,
        replicas,
        revision_history_limit,
        selector,
        strategy,
        template,
    } = desired;

    observed.min_ready_seconds == *min_ready_seconds
        && observed.paused == *paused
        && observed.progress_deadline_seconds == *progress_deadline_seconds
        && observed.replicas == *replicas
        && observed.revision_history_limit == *revision_history_limit
        && observed.selector == *selector
        && observed.strategy == *strategy
        && observed.template == *template
}

/// Map a Deployment back to the App that manages it.
///
/// A controller owner reference decides when present. Otherwise the
/// `<name>-deploy` name and `app=<name>` label must agree, which covers
/// Deployments created under [`DeletionPolicy::Explicit`].
pub fn owning_app(deployment: &Deployment) -> Option<NamespacedName> {
    let namespace = deployment.namespace()?;

    if let Some(owner) = deployment
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
    {
        let is_app = owner.kind == App::kind(&()) && owner.api_version == App::api_version(&());
        return is_app.then(|| NamespacedName::new(namespace, owner.name.clone()));
    }

    let name = deployment.name_any();
    let app_name = name.strip_suffix(WORKLOAD_SUFFIX)?;
    let labelled = deployment.labels().get(APP_LABEL).map(String::as_str) == Some(app_name);
    labelled.then(|| NamespacedName::new(namespace, app_name))
}

/// Controller owner reference of `deployment` when it points at anything
/// other than `app`
pub fn foreign_controller<'a>(deployment: &'a Deployment, app: &App) -> Option<&'a OwnerReference> {
    let owner = deployment
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))?;

    let same_kind = owner.kind == App::kind(&()) && owner.api_version == App::api_version(&());
    let same_app = match app.metadata.uid.as_deref() {
        Some(uid) => owner.uid == uid,
        None => owner.name == app.name_any(),
    };
    (!(same_kind && same_app)).then_some(owner)
}

/// Bring the managed labels and owner references of `desired` into
/// `found`, keeping anything else already there. Returns whether `found`
/// changed.
pub fn merge_managed_metadata(found: &mut Deployment, desired: &Deployment) -> bool {
    let mut changed = false;

    let labels = found.metadata.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in desired.labels() {
        if labels.get(key) != Some(value) {
            labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    for owner in desired.owner_references() {
        let refs = found.metadata.owner_references.get_or_insert_with(Vec::new);
        match refs.iter_mut().find(|r| r.uid == owner.uid) {
            Some(existing) if existing == owner => {}
            Some(existing) => {
                *existing = owner.clone();
                changed = true;
            }
            None => {
                refs.push(owner.clone());
                changed = true;
            }
        }
    }

    changed
}

fn build_owner_reference(app: &App) -> OwnerReference {
    OwnerReference {
        api_version: App::api_version(&()).to_string(),
        kind: App::kind(&()).to_string(),
        name: app.name_any(),
        uid: app.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AppSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn app(name: &str) -> App {
        let mut app = App::new(name, AppSpec::default());
        app.metadata.namespace = Some("ns".to_string());
        app.metadata.uid = Some("uid-1".to_string());
        app.spec.workload_template.template = PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "web".to_string(),
                    image: Some("nginx:1.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        };
        app
    }

    #[test]
    fn user_selector_and_template_labels_are_reconciled() {
        let mut app = app("foo");
        app.spec.workload_template.selector = LabelSelector {
            match_labels: Some(build_labels("someone-else")),
            ..Default::default()
        };
        let mut template_labels = build_labels("bar");
        template_labels.insert("tier".to_string(), "frontend".to_string());
        app.spec.workload_template.template.metadata = Some(ObjectMeta {
            labels: Some(template_labels),
            ..Default::default()
        });

        let spec = desired_spec(&app);
        let labels = spec.template.metadata.unwrap().labels.unwrap();

        assert_eq!(spec.selector.match_labels, Some(build_labels("foo")));
        assert_eq!(labels.get("app").map(String::as_str), Some("foo"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("frontend"));
    }

    #[test]
    fn empty_or_expression_selectors_never_match() {
        let mut spec = desired_spec(&app("foo"));
        assert!(selector_matches_template(&spec));

        spec.selector.match_labels = Some(BTreeMap::new());
        assert!(!selector_matches_template(&spec));

        spec.selector = LabelSelector {
            match_labels: Some(build_labels("foo")),
            match_expressions: Some(vec![Default::default()]),
        };
        assert!(!selector_matches_template(&spec));
    }

    #[test]
    fn owner_reference_follows_deletion_policy() {
        let app = app("foo");

        let owned = build_deployment(&app, DeletionPolicy::OwnerReference).unwrap();
        let refs = owned.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "App");
        assert_eq!(refs[0].api_version, "app.o0w0o.cn/v1");
        assert_eq!(refs[0].uid, "uid-1");
        assert_eq!(refs[0].controller, Some(true));

        let explicit = build_deployment(&app, DeletionPolicy::Explicit).unwrap();
        assert!(explicit.metadata.owner_references.is_none());
    }

    #[test]
    fn owning_app_prefers_controller_reference() {
        let app = app("foo");
        let deployment = build_deployment(&app, DeletionPolicy::OwnerReference).unwrap();
        assert_eq!(owning_app(&deployment), Some(NamespacedName::new("ns", "foo")));

        let mut foreign = deployment.clone();
        foreign.metadata.owner_references.as_mut().unwrap()[0].kind = "ReplicaSet".to_string();
        assert_eq!(owning_app(&foreign), None);
    }

    #[test]
    fn owning_app_falls_back_to_name_and_label() {
        let app = app("foo");
        let deployment = build_deployment(&app, DeletionPolicy::Explicit).unwrap();
        assert_eq!(owning_app(&deployment), Some(NamespacedName::new("ns", "foo")));

        let mut relabelled = deployment.clone();
        relabelled.metadata.labels = Some(build_labels("bar"));
        assert_eq!(owning_app(&relabelled), None);

        let mut renamed = deployment;
        renamed.metadata.name = Some("foo".to_string());
        assert_eq!(owning_app(&renamed), None);
    }

    #[test]
    fn foreign_controller_detects_other_owners() {
        let app = app("foo");
        let owned = build_deployment(&app, DeletionPolicy::OwnerReference).unwrap();
        assert!(foreign_controller(&owned, &app).is_none());

        let ownerless = build_deployment(&app, DeletionPolicy::Explicit).unwrap();
        assert!(foreign_controller(&ownerless, &app).is_none());

        let mut recreated = owned.clone();
        recreated.metadata.owner_references.as_mut().unwrap()[0].uid = "uid-2".to_string();
        assert!(foreign_controller(&recreated, &app).is_some());

        let mut other_kind = owned;
        other_kind.metadata.owner_references.as_mut().unwrap()[0].kind = "Rollout".to_string();
        assert_eq!(foreign_controller(&other_kind, &app).unwrap().kind, "Rollout");
    }

    #[test]
    fn managed_metadata_is_merged_not_replaced() {
        let app = app("foo");
        let desired = build_deployment(&app, DeletionPolicy::OwnerReference).unwrap();

        let mut found = build_deployment(&app, DeletionPolicy::Explicit).unwrap();
        found.metadata.labels = Some(BTreeMap::from([("team".to_string(), "web".to_string())]));

        assert!(merge_managed_metadata(&mut found, &desired));
        let labels = found.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("foo"));
        assert_eq!(labels.get("team").map(String::as_str), Some("web"));
        assert_eq!(found.metadata.owner_references, desired.metadata.owner_references);

        assert!(!merge_managed_metadata(&mut found, &desired));
    }

    #[test]
    fn server_defaulted_fields_count_as_drift() {
        let desired = desired_spec(&app("foo"));
        let mut defaulted = desired.clone();
        defaulted.revision_history_limit = Some(10);
        defaulted.progress_deadline_seconds = Some(600);
        defaulted.template.spec.as_mut().unwrap().containers[0].image_pull_policy =
            Some("IfNotPresent".to_string());
        assert!(!workload_spec_matches(&defaulted, &desired));

        let mut pinned = app("foo");
        pinned.spec.workload_template = defaulted.clone();
        assert!(workload_spec_matches(&defaulted, &desired_spec(&pinned)));
    }

    #[test]
    fn spec_comparison_sees_every_field() {
        let desired = desired_spec(&app("foo"));
        assert!(workload_spec_matches(&desired.clone(), &desired));

        let mut paused = desired.clone();
        paused.paused = Some(true);
        assert!(!workload_spec_matches(&paused, &desired));

        let mut history = desired.clone();
        history.revision_history_limit = Some(3);
        assert!(!workload_spec_matches(&history, &desired));

        let mut image = desired.clone();
        image.template.spec.as_mut().unwrap().containers[0].image = Some("nginx:2.0".to_string());
        assert!(!workload_spec_matches(&image, &desired));
    }
}
