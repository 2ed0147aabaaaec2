use super::rollout::any_object;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default time a template may spend progressing before it is marked Failed
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: i32 = 600;

/// Default grace window between finishing and scaling a template down
pub const DEFAULT_SCALE_DOWN_DELAY_SECONDS: i32 = 30;

/// Experiment runs one or more pod templates side by side for a fixed duration
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rollgate.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// How long the experiment runs once all templates are available
    /// (e.g., "30s", "5m"). Runs until terminated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Seconds a template may stay progressing before it is considered failed
    #[serde(
        rename = "progressDeadlineSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_deadline_seconds: Option<i32>,

    /// Seconds to wait after the experiment finishes before scaling templates down
    #[serde(
        rename = "scaleDownDelaySeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_down_delay_seconds: Option<i32>,

    /// Request early termination of the experiment
    #[serde(default)]
    pub terminate: bool,

    /// Pod templates to run
    pub templates: Vec<TemplateSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TemplateSpec {
    /// Template name, unique within the experiment
    pub name: String,

    /// Number of desired pods (defaults to 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for pods
    #[schemars(schema_with = "any_object")]
    pub selector: LabelSelector,

    /// Pod template for this variant
    #[schemars(schema_with = "any_object")]
    pub template: PodTemplateSpec,

    /// Request a Service pointing at this template's pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<TemplateService>,

    /// Extra input to the identity hash so identical templates never collide
    #[serde(rename = "collisionSalt", skip_serializing_if = "Option::is_none")]
    pub collision_salt: Option<String>,
}

impl TemplateSpec {
    pub fn replicas_or_default(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TemplateService {}

/// Phase of an Experiment or of one of its analysis runs
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ExperimentPhase {
    Pending,
    Running,
    Successful,
    Failed,
    Error,
    Inconclusive,
}

impl ExperimentPhase {
    /// Terminal phases never transition again
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            ExperimentPhase::Successful
                | ExperimentPhase::Failed
                | ExperimentPhase::Error
                | ExperimentPhase::Inconclusive
        )
    }

    /// Terminal and not successful
    pub fn is_unsuccessful(&self) -> bool {
        self.is_completed() && *self != ExperimentPhase::Successful
    }
}

impl std::fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Status of a single template
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TemplateStatusCode {
    Progressing,
    Running,
    Successful,
    Failed,
    Error,
}

impl TemplateStatusCode {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TemplateStatusCode::Successful | TemplateStatusCode::Failed | TemplateStatusCode::Error
        )
    }

    /// Higher is worse; used to aggregate template statuses into a phase
    pub fn severity(&self) -> u8 {
        match self {
            TemplateStatusCode::Successful => 0,
            TemplateStatusCode::Running => 1,
            TemplateStatusCode::Progressing => 2,
            TemplateStatusCode::Failed => 3,
            TemplateStatusCode::Error => 4,
        }
    }

    pub fn to_phase(self) -> ExperimentPhase {
        match self {
            TemplateStatusCode::Progressing => ExperimentPhase::Pending,
            TemplateStatusCode::Running => ExperimentPhase::Running,
            TemplateStatusCode::Successful => ExperimentPhase::Successful,
            TemplateStatusCode::Failed => ExperimentPhase::Failed,
            TemplateStatusCode::Error => ExperimentPhase::Error,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct TemplateStatus {
    pub name: String,

    /// Replicas observed on the template's ReplicaSet
    #[serde(default)]
    pub replicas: i32,

    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    pub status: TemplateStatusCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Service created for this template, if any
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// RFC3339 time of the last status change
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,

    /// Bumped when the ReplicaSet name collides with a foreign object
    #[serde(rename = "collisionCount", skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

impl TemplateStatus {
    pub fn new(name: &str) -> Self {
        TemplateStatus {
            name: name.to_string(),
            replicas: 0,
            updated_replicas: 0,
            ready_replicas: 0,
            available_replicas: 0,
            status: TemplateStatusCode::Progressing,
            message: None,
            service_name: None,
            last_transition_time: None,
            collision_count: None,
        }
    }
}

/// Analysis run referenced by the experiment; its phase is an opaque input
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentAnalysisRunStatus {
    pub name: String,

    #[serde(rename = "analysisRun")]
    pub analysis_run: String,

    pub phase: ExperimentPhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False"
    pub status: String,

    pub reason: String,

    pub message: String,

    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: String,

    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// Status of the Experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ExperimentPhase>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 time at which every template first became available
    #[serde(rename = "availableAt", skip_serializing_if = "Option::is_none")]
    pub available_at: Option<String>,

    #[serde(rename = "templateStatuses", default)]
    pub template_statuses: Vec<TemplateStatus>,

    #[serde(rename = "analysisRuns", default)]
    pub analysis_runs: Vec<ExperimentAnalysisRunStatus>,

    #[serde(default)]
    pub conditions: Vec<ExperimentCondition>,
}

impl ExperimentStatus {
    pub fn template_status(&self, name: &str) -> Option<&TemplateStatus> {
        self.template_statuses.iter().find(|ts| ts.name == name)
    }
}

impl Experiment {
    pub fn progress_deadline_seconds(&self) -> i32 {
        self.spec
            .progress_deadline_seconds
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS)
    }

    pub fn scale_down_delay_seconds(&self) -> i32 {
        self.spec
            .scale_down_delay_seconds
            .unwrap_or(DEFAULT_SCALE_DOWN_DELAY_SECONDS)
    }

    /// Phase recorded in the last observed status
    pub fn observed_phase(&self) -> Option<ExperimentPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// The experiment reached a terminal phase in a previous reconcile
    pub fn has_finished(&self) -> bool {
        self.observed_phase()
            .map(|p| p.is_completed())
            .unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
