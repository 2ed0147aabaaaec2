//! Offline validation of rollout manifests
//!
//! A manifest file may hold any number of YAML documents. Rollouts are
//! validated on their own and against the Services and Ingresses found in the
//! same file.

use crate::controller::validation::validate_rollout;
use crate::crd::rollout::Rollout;
use crate::trafficrouting::alb::ingress_has_service;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LintError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("document {index}: {source}")]
    Yaml {
        index: usize,
        source: serde_yaml::Error,
    },

    #[error("rollout '{rollout}': {message}")]
    Invalid { rollout: String, message: String },

    #[error("{path}: {count} problem(s) found")]
    Failed { path: String, count: usize },
}

/// Resources collected from a manifest, in file order
#[derive(Debug, Default)]
pub struct Manifest {
    pub rollouts: Vec<Rollout>,
    pub services: Vec<Service>,
    pub ingresses: Vec<Ingress>,
}

/// Parse every document of a multi-document YAML string
///
/// Documents of other kinds are ignored, empty documents are skipped.
pub fn parse_manifest(raw: &str) -> Result<Manifest, LintError> {
    let mut manifest = Manifest::default();

    for (index, document) in serde_yaml::Deserializer::from_str(raw).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|source| LintError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }

        let field = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let (api_version, kind) = (field("apiVersion"), field("kind"));
        let group = api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");

        match (group, kind.as_str()) {
            ("rollgate.io", "Rollout") => manifest.rollouts.push(decode(value, index)?),
            ("", "Service") => manifest.services.push(decode(value, index)?),
            ("networking.k8s.io", "Ingress") => manifest.ingresses.push(decode(value, index)?),
            _ => {}
        }
    }

    Ok(manifest)
}

fn decode<T: DeserializeOwned>(value: serde_yaml::Value, index: usize) -> Result<T, LintError> {
    serde_yaml::from_value(value).map_err(|source| LintError::Yaml { index, source })
}

/// Every problem found in the manifest, in rollout order
pub fn lint_manifest(manifest: &Manifest) -> Vec<LintError> {
    let mut errors = Vec::new();
    for rollout in &manifest.rollouts {
        let name = rollout.name_any();
        if let Err(message) = validate_rollout(rollout) {
            errors.push(LintError::Invalid {
                rollout: name,
                message,
            });
            continue;
        }
        for message in reference_errors(rollout, manifest) {
            errors.push(LintError::Invalid {
                rollout: name.clone(),
                message,
            });
        }
    }
    errors
}

fn reference_errors(rollout: &Rollout, manifest: &Manifest) -> Vec<String> {
    let Some(canary) = rollout.spec.strategy.canary.as_ref() else {
        return Vec::new();
    };
    let mut errors = Vec::new();

    for (field, service) in [
        ("canaryService", &canary.canary_service),
        ("stableService", &canary.stable_service),
    ] {
        if !manifest.services.iter().any(|s| &s.name_any() == service) {
            errors.push(format!("{} {:?} not found in manifest", field, service));
        }
    }

    if let Some(alb) = canary.traffic_routing.as_ref().and_then(|t| t.alb.as_ref()) {
        let backend = alb.root_service.as_ref().unwrap_or(&canary.stable_service);
        match manifest.ingresses.iter().find(|i| i.name_any() == alb.ingress) {
            None => errors.push(format!("ingress {:?} not found in manifest", alb.ingress)),
            Some(ingress) if !ingress_has_service(ingress, backend) => errors.push(format!(
                "ingress {:?} has no rule with backend service {:?}",
                alb.ingress, backend
            )),
            Some(_) => {}
        }
    }

    errors
}

/// Read and lint a manifest file
///
/// Returns every problem found; the caller decides how to report them.
pub fn lint_file(path: &Path) -> Result<Vec<LintError>, LintError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LintError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let manifest = parse_manifest(&raw)?;
    Ok(lint_manifest(&manifest))
}

/// Overall result of a lint run whose problems were already printed
pub fn outcome(path: &Path, errors: &[LintError]) -> Result<(), LintError> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(LintError::Failed {
        path: path.display().to_string(),
        count: errors.len(),
    })
}
