use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rollout is a Custom Resource for managing progressive delivery
///
/// The controller walks `spec.strategy.canary.steps`, shifting traffic through
/// the configured routers and holding at pause steps until they complete.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "rollgate.io",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced,
    status = "RolloutStatus",
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Step", "type":"integer", "jsonPath":".status.currentStepIndex"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.currentWeight"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct RolloutSpec {
    /// Number of desired pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Label selector for pods
    #[schemars(schema_with = "any_object")]
    pub selector: LabelSelector,

    /// Template describes the pods that will be created
    #[schemars(schema_with = "any_object")]
    pub template: PodTemplateSpec,

    /// Pauses the rollout; set by the controller at pause steps and cleared to resume
    #[serde(default)]
    pub paused: bool,

    /// Instant (RFC3339) at which the rollout's pods should be restarted
    #[serde(rename = "restartAt", skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<String>,

    /// Deployment strategy (currently only canary)
    pub strategy: RolloutStrategy,
}

fn default_replicas() -> i32 {
    1
}

pub(crate) fn any_object(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RolloutStrategy {
    /// Canary deployment strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct CanaryStrategy {
    /// Name of the service that selects canary pods
    #[serde(rename = "canaryService")]
    pub canary_service: String,

    /// Name of the service that selects stable pods
    #[serde(rename = "stableService")]
    pub stable_service: String,

    /// Steps define the canary rollout progression
    #[serde(default)]
    pub steps: Vec<CanaryStep>,

    /// Traffic routing configuration
    #[serde(rename = "trafficRouting", skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CanaryStep {
    /// Set the percentage of traffic to route to canary
    #[serde(rename = "setWeight", skip_serializing_if = "Option::is_none")]
    pub set_weight: Option<i32>,

    /// Pause the rollout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<RolloutPause>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutPause {
    /// Duration (e.g., "30s", "5m")
    /// If not specified, pauses indefinitely until manually resumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficRouting {
    /// AWS Application Load Balancer driven through Ingress annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alb: Option<AlbTrafficRouting>,

    /// Gateway API configuration
    #[serde(rename = "gatewayAPI", skip_serializing_if = "Option::is_none")]
    pub gateway_api: Option<GatewayAPIRouting>,

    /// Out-of-process traffic router plugins keyed by plugin name
    ///
    /// The value is opaque to the controller and handed to the plugin as-is.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "any_object")]
    pub plugins: BTreeMap<String, serde_json::Value>,

    /// Override the controller-wide weight verification default
    #[serde(rename = "verifyWeight", skip_serializing_if = "Option::is_none")]
    pub verify_weight: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AlbTrafficRouting {
    /// Name of the Ingress fronting the load balancer
    pub ingress: String,

    /// Service port the ALB forwards to
    #[serde(rename = "servicePort")]
    pub service_port: i32,

    /// Service referenced by the Ingress rule (defaults to the stable service)
    #[serde(rename = "rootService", skip_serializing_if = "Option::is_none")]
    pub root_service: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct GatewayAPIRouting {
    /// Name of the HTTPRoute to manipulate
    #[serde(rename = "httpRoute")]
    pub http_route: String,
}

/// Phase of a Rollout
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Progressing,
    Paused,
    Healthy,
    Degraded,
}

/// Status of the Rollout
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutStatus {
    /// Current canary step index (0-indexed)
    #[serde(rename = "currentStepIndex", skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<i32>,

    /// Current canary weight percentage
    #[serde(rename = "currentWeight", skip_serializing_if = "Option::is_none")]
    pub current_weight: Option<i32>,

    /// Timestamp when current pause started (RFC3339 format)
    #[serde(rename = "pauseStartTime", skip_serializing_if = "Option::is_none")]
    pub pause_start_time: Option<String>,

    /// Pod template hash of the stable revision
    #[serde(rename = "stableHash", skip_serializing_if = "Option::is_none")]
    pub stable_hash: Option<String>,

    /// Pod template hash of the canary revision
    #[serde(rename = "canaryHash", skip_serializing_if = "Option::is_none")]
    pub canary_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Rollout {
    /// Canary steps, empty when no canary strategy is configured
    pub fn steps(&self) -> &[CanaryStep] {
        self.spec
            .strategy
            .canary
            .as_ref()
            .map(|c| c.steps.as_slice())
            .unwrap_or_default()
    }

    /// Traffic routing block of the canary strategy, if any
    pub fn traffic_routing(&self) -> Option<&TrafficRouting> {
        self.spec
            .strategy
            .canary
            .as_ref()
            .and_then(|c| c.traffic_routing.as_ref())
    }
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
