use crate::crd::experiment::{Experiment, TemplateSpec};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const EXPERIMENT_LABEL: &str = "rollgate.io/experiment";
pub const TEMPLATE_LABEL: &str = "rollgate.io/template";
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";
pub const MANAGED_BY_ANNOTATION: &str = "rollgate.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "rollgate";
pub const SCALE_DOWN_DEADLINE_ANNOTATION: &str = "rollgate.io/scale-down-deadline";

/// Compute a stable 10-character identity hash for a pod template
///
/// Covers the serialized template, the collision count (when set) and the
/// template's collision salt, so a changed template or a bumped collision
/// count yields a different ReplicaSet name.
pub fn compute_pod_template_hash(
    template: &PodTemplateSpec,
    collision_count: Option<i32>,
    salt: Option<&str>,
) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(template)?;

    let mut hasher = Sha256::new();
    hasher.update(&json);
    if let Some(count) = collision_count {
        hasher.update((count as u32).to_le_bytes());
    }
    if let Some(salt) = salt {
        hasher.update(salt.as_bytes());
    }

    let digest = hex::encode(hasher.finalize());
    Ok(digest[..10].to_string())
}

pub fn replica_set_name(experiment: &str, template: &str, hash: &str) -> String {
    format!("{}-{}-{}", experiment, template, hash)
}

/// Labels identifying the pods of one template revision
fn pod_labels(experiment: &str, template: &TemplateSpec, hash: &str) -> BTreeMap<String, String> {
    let mut labels = template
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(EXPERIMENT_LABEL.to_string(), experiment.to_string());
    labels.insert(TEMPLATE_LABEL.to_string(), template.name.clone());
    labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    labels
}

/// Labels on every object owned by an experiment template
pub fn owned_labels(experiment: &str, template: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (EXPERIMENT_LABEL.to_string(), experiment.to_string()),
        (TEMPLATE_LABEL.to_string(), template.to_string()),
    ])
}

pub fn managed_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(
        MANAGED_BY_ANNOTATION.to_string(),
        MANAGED_BY_VALUE.to_string(),
    )])
}

/// Build the ReplicaSet backing one experiment template
pub fn build_replica_set(
    experiment: &Experiment,
    template: &TemplateSpec,
    hash: &str,
    replicas: i32,
) -> ReplicaSet {
    let experiment_name = experiment.name_any();
    let labels = pod_labels(&experiment_name, template, hash);

    let mut pod_template = template.template.clone();
    let mut pod_meta = pod_template.metadata.unwrap_or_default();
    pod_meta.labels = Some(labels.clone());
    pod_template.metadata = Some(pod_meta);

    let mut match_labels = template.selector.match_labels.clone().unwrap_or_default();
    match_labels.insert(EXPERIMENT_LABEL.to_string(), experiment_name.clone());
    match_labels.insert(TEMPLATE_LABEL.to_string(), template.name.clone());
    match_labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    let selector = LabelSelector {
        match_labels: Some(match_labels),
        match_expressions: template.selector.match_expressions.clone(),
    };

    let mut rs_labels = owned_labels(&experiment_name, &template.name);
    rs_labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(replica_set_name(&experiment_name, &template.name, hash)),
            namespace: experiment.namespace(),
            labels: Some(rs_labels),
            annotations: Some(managed_annotations()),
            owner_references: experiment.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(replicas),
            selector,
            template: Some(pod_template),
            ..Default::default()
        }),
        status: None,
    }
}

/// Template a ReplicaSet or Service belongs to, from its labels
pub fn template_of<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(TEMPLATE_LABEL))
        .map(String::as_str)
}

/// Whether the object is controlled by the experiment with the given uid
pub fn is_owned_by<K: Resource>(obj: &K, uid: &str) -> bool {
    obj.meta()
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == uid))
        .unwrap_or(false)
}

/// Replica count the ReplicaSet currently asks for (API default is 1)
pub fn spec_replicas(rs: &ReplicaSet) -> i32 {
    rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

pub fn scale_down_deadline(rs: &ReplicaSet) -> Option<DateTime<Utc>> {
    rs.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SCALE_DOWN_DEADLINE_ANNOTATION))
        .and_then(|v| crate::controller::clock::parse_time(v))
}

pub fn has_scale_down_annotation(rs: &ReplicaSet) -> bool {
    rs.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(SCALE_DOWN_DEADLINE_ANNOTATION))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::crd::experiment::ExperimentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn template(name: &str, image: &str) -> TemplateSpec {
        TemplateSpec {
            name: name.to_string(),
            replicas: Some(2),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_string(), "demo".to_string())])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([("app".to_string(), "demo".to_string())])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            service: None,
            collision_salt: None,
        }
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = template("a", "nginx:1");
        let h1 = compute_pod_template_hash(&a.template, None, None).unwrap();
        let h2 = compute_pod_template_hash(&a.template, None, None).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 10);

        let changed = template("a", "nginx:2");
        assert_ne!(
            h1,
            compute_pod_template_hash(&changed.template, None, None).unwrap()
        );
        assert_ne!(
            h1,
            compute_pod_template_hash(&a.template, Some(1), None).unwrap()
        );
        assert_ne!(
            h1,
            compute_pod_template_hash(&a.template, None, Some("baseline")).unwrap()
        );
    }

    #[test]
    fn test_build_replica_set_labels_and_owner() {
        let mut experiment = Experiment::new(
            "exp",
            ExperimentSpec {
                duration: None,
                progress_deadline_seconds: None,
                scale_down_delay_seconds: None,
                terminate: false,
                templates: vec![],
            },
        );
        experiment.metadata.namespace = Some("default".to_string());
        experiment.metadata.uid = Some("uid-1".to_string());

        let rs = build_replica_set(&experiment, &template("baseline", "nginx:1"), "abc", 2);

        assert_eq!(rs.metadata.name.as_deref(), Some("exp-baseline-abc"));
        assert_eq!(template_of(&rs), Some("baseline"));
        assert!(is_owned_by(&rs, "uid-1"));
        assert_eq!(spec_replicas(&rs), 2);
        let spec = rs.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("demo"));
        assert_eq!(
            selector.get(POD_TEMPLATE_HASH_LABEL).map(String::as_str),
            Some("abc")
        );
        let pod_labels = spec.template.unwrap().metadata.unwrap().labels.unwrap();
        assert_eq!(
            pod_labels.get(EXPERIMENT_LABEL).map(String::as_str),
            Some("exp")
        );
    }
}
