//! AWS ALB traffic routing through Ingress annotations
//!
//! The AWS load balancer controller reads a forward action from
//! `alb.ingress.kubernetes.io/actions.<service>` and turns it into weighted
//! target groups. Weights are written as a minimal annotation patch and
//! verified against the target groups of the provisioned load balancer.

use super::{canary_services, weighted_targets, TrafficRoutingError, TrafficRoutingReconciler, WeightDestination};
use crate::crd::rollout::{AlbTrafficRouting, Rollout};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const ACTION_ANNOTATION_PREFIX: &str = "alb.ingress.kubernetes.io/actions.";

/// Which rollout owns which action annotation on a shared Ingress
pub const MANAGED_ACTIONS_ANNOTATION: &str = "rollgate.io/managed-alb-actions";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlbTargetGroup {
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "ServicePort")]
    pub service_port: String,
    #[serde(rename = "Weight", default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlbForwardConfig {
    #[serde(rename = "TargetGroups")]
    pub target_groups: Vec<AlbTargetGroup>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlbAction {
    #[serde(rename = "Type")]
    pub type_: String,
    #[serde(rename = "ForwardConfig")]
    pub forward_config: AlbForwardConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancer {
    pub arn: String,
    pub dns_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetGroup {
    pub arn: String,
    /// `<namespace>/<ingress>-<service>:<port>` tag set by the AWS controller
    pub resource_id: Option<String>,
    pub weight: Option<i32>,
}

/// Ingress reads and annotation patches
#[async_trait]
pub trait IngressClient: Send + Sync {
    async fn get_ingress(&self, namespace: &str, name: &str)
        -> Result<Option<Ingress>, TrafficRoutingError>;

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), TrafficRoutingError>;
}

/// Read-only view of provisioned load balancers
#[async_trait]
pub trait LoadBalancerReader: Send + Sync {
    async fn find_load_balancer_by_dns_name(
        &self,
        dns_name: &str,
    ) -> Result<Option<LoadBalancer>, TrafficRoutingError>;

    async fn target_groups(&self, load_balancer_arn: &str)
        -> Result<Vec<TargetGroup>, TrafficRoutingError>;
}

pub struct KubeIngressClient {
    client: kube::Client,
    timeout: Duration,
}

impl KubeIngressClient {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        KubeIngressClient { client, timeout }
    }
}

#[async_trait]
impl IngressClient for KubeIngressClient {
    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Ingress>, TrafficRoutingError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        tokio::time::timeout(self.timeout, api.get_opt(name))
            .await
            .map_err(|_| TrafficRoutingError::Timeout(self.timeout))?
            .map_err(TrafficRoutingError::from)
    }

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), TrafficRoutingError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        tokio::time::timeout(
            self.timeout,
            api.patch(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await
        .map_err(|_| TrafficRoutingError::Timeout(self.timeout))??;
        Ok(())
    }
}

/// Parse the managed-actions annotation (`rollout:key,rollout:key`)
pub fn parse_managed_actions(raw: &str) -> Result<BTreeMap<String, String>, TrafficRoutingError> {
    let mut actions = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (rollout, key) = entry.split_once(':').ok_or_else(|| {
            TrafficRoutingError::Misconfigured(format!(
                "malformed {} entry '{}'",
                MANAGED_ACTIONS_ANNOTATION, entry
            ))
        })?;
        actions.insert(rollout.to_string(), key.to_string());
    }
    Ok(actions)
}

pub fn format_managed_actions(actions: &BTreeMap<String, String>) -> String {
    actions
        .iter()
        .map(|(rollout, key)| format!("{}:{}", rollout, key))
        .collect::<Vec<_>>()
        .join(",")
}

/// Merge patch turning `current` annotations into `desired`, `None` when equal
pub fn annotations_patch(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> Option<Value> {
    let mut changes = Map::new();
    for (key, value) in desired {
        if current.get(key) != Some(value) {
            changes.insert(key.clone(), Value::String(value.clone()));
        }
    }
    for key in current.keys() {
        if !desired.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }

    if changes.is_empty() {
        None
    } else {
        Some(json!({ "metadata": { "annotations": changes } }))
    }
}

/// AWS target group resource ID for a service behind an Ingress
pub fn target_group_resource_id(namespace: &str, ingress: &str, service: &str, port: i32) -> String {
    format!("{}/{}-{}:{}", namespace, ingress, service, port)
}

/// Whether any HTTP rule of the Ingress routes to `service`
pub fn ingress_has_service(ingress: &Ingress, service: &str) -> bool {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
        .any(|backend| backend.name == service)
}

fn load_balancer_hostnames(ingress: &Ingress) -> Vec<String> {
    ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|i| i.hostname.clone())
        .filter(|h| !h.is_empty())
        .collect()
}

pub struct AlbReconciler {
    rollout: String,
    namespace: String,
    canary_service: String,
    stable_service: String,
    config: AlbTrafficRouting,
    ingresses: Arc<dyn IngressClient>,
    load_balancers: Option<Arc<dyn LoadBalancerReader>>,
    verify: bool,
}

impl AlbReconciler {
    pub fn new(
        rollout: &Rollout,
        config: AlbTrafficRouting,
        ingresses: Arc<dyn IngressClient>,
        load_balancers: Option<Arc<dyn LoadBalancerReader>>,
        verify: bool,
    ) -> Result<Self, TrafficRoutingError> {
        let (canary_service, stable_service) = canary_services(rollout)?;
        let namespace = rollout
            .namespace()
            .ok_or_else(|| TrafficRoutingError::Misconfigured("rollout has no namespace".to_string()))?;
        Ok(AlbReconciler {
            rollout: rollout.name_any(),
            namespace,
            canary_service,
            stable_service,
            config,
            ingresses,
            load_balancers,
            verify,
        })
    }

    /// Service whose Ingress rule carries the forward action
    fn action_service(&self) -> &str {
        self.config
            .root_service
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.stable_service)
    }

    fn action_key(&self) -> String {
        format!("{}{}", ACTION_ANNOTATION_PREFIX, self.action_service())
    }

    pub fn forward_action(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<AlbAction, TrafficRoutingError> {
        let port = self.config.service_port.to_string();
        let target_groups = weighted_targets(
            &self.canary_service,
            &self.stable_service,
            desired_weight,
            additional,
        )?
        .into_iter()
        .map(|(service_name, weight)| AlbTargetGroup {
            service_name,
            service_port: port.clone(),
            weight: Some(i64::from(weight)),
        })
        .collect();

        Ok(AlbAction {
            type_: "forward".to_string(),
            forward_config: AlbForwardConfig { target_groups },
        })
    }

    async fn ingress(&self) -> Result<Ingress, TrafficRoutingError> {
        self.ingresses
            .get_ingress(&self.namespace, &self.config.ingress)
            .await?
            .ok_or_else(|| TrafficRoutingError::NotFound(format!("ingress/{}", self.config.ingress)))
    }

    async fn apply(
        &self,
        current: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Result<bool, TrafficRoutingError> {
        let Some(patch) = annotations_patch(current, desired) else {
            info!(rollout = ?self.rollout, ingress = ?self.config.ingress, "No changes to the ALB Ingress");
            return Ok(false);
        };
        debug!(rollout = ?self.rollout, patch = %patch, "Applying ALB Ingress patch");
        self.ingresses
            .patch_ingress(&self.namespace, &self.config.ingress, &patch)
            .await?;
        Ok(true)
    }

    /// Compare the forward action stored on the Ingress with the desired one
    fn annotation_matches(
        &self,
        ingress: &Ingress,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<bool, TrafficRoutingError> {
        let stored = ingress.annotations().get(&self.action_key());
        let Some(stored) = stored else {
            return Ok(false);
        };
        let stored: AlbAction = serde_json::from_str(stored)?;
        Ok(stored == self.forward_action(desired_weight, additional)?)
    }
}

#[async_trait]
impl TrafficRoutingReconciler for AlbReconciler {
    fn type_name(&self) -> String {
        "ALB".to_string()
    }

    async fn set_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<(), TrafficRoutingError> {
        let ingress = self.ingress().await?;
        let action_service = self.action_service();
        if !ingress_has_service(&ingress, action_service) {
            return Err(TrafficRoutingError::Misconfigured(format!(
                "ingress does not have service `{}` in rules",
                action_service
            )));
        }

        let current = ingress.annotations().clone();
        let mut desired = current.clone();
        let key = self.action_key();
        desired.insert(
            key.clone(),
            serde_json::to_string(&self.forward_action(desired_weight, additional)?)?,
        );
        let mut managed = parse_managed_actions(
            current
                .get(MANAGED_ACTIONS_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default(),
        )?;
        managed.insert(self.rollout.clone(), key);
        desired.insert(
            MANAGED_ACTIONS_ANNOTATION.to_string(),
            format_managed_actions(&managed),
        );

        if self.apply(&current, &desired).await? {
            info!(
                rollout = ?self.rollout,
                ingress = ?self.config.ingress,
                desired_weight,
                "Updated ALB Ingress"
            );
        }
        Ok(())
    }

    async fn verify_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<bool, TrafficRoutingError> {
        if !self.verify {
            return Ok(true);
        }

        let ingress = self.ingress().await?;
        let hostnames = load_balancer_hostnames(&ingress);
        if hostnames.is_empty() {
            info!(ingress = ?self.config.ingress, "LoadBalancer not yet allocated");
            return Ok(false);
        }

        let Some(reader) = &self.load_balancers else {
            // Without a load balancer API the stored action is the best evidence
            return self.annotation_matches(&ingress, desired_weight, additional);
        };

        let port = self.config.service_port;
        let canary_id =
            target_group_resource_id(&self.namespace, &self.config.ingress, &self.canary_service, port);
        let mut expected: BTreeMap<String, i32> = BTreeMap::new();
        expected.insert(canary_id.clone(), desired_weight);
        for dest in additional {
            expected.insert(
                target_group_resource_id(&self.namespace, &self.config.ingress, &dest.service_name, port),
                dest.weight,
            );
        }

        for hostname in hostnames {
            let Some(lb) = reader.find_load_balancer_by_dns_name(&hostname).await? else {
                info!(hostname = %hostname, "LoadBalancer not found");
                return Ok(false);
            };

            let mut canary_seen = false;
            for tg in reader.target_groups(&lb.arn).await? {
                let (Some(resource_id), Some(weight)) = (tg.resource_id.as_ref(), tg.weight) else {
                    continue;
                };
                let Some(want) = expected.get(resource_id) else {
                    continue;
                };
                info!(
                    lb = %lb.arn,
                    tg = %tg.arn,
                    desired = *want,
                    current = weight,
                    "Target group weight"
                );
                if weight != *want {
                    return Ok(false);
                }
                if *resource_id == canary_id {
                    canary_seen = true;
                }
            }
            if !canary_seen {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn remove_managed_routes(&self) -> Result<(), TrafficRoutingError> {
        let ingress = match self.ingress().await {
            Ok(ingress) => ingress,
            Err(TrafficRoutingError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let current = ingress.annotations().clone();
        let mut desired = current.clone();
        let mut managed = parse_managed_actions(
            current
                .get(MANAGED_ACTIONS_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default(),
        )?;
        if let Some(key) = managed.remove(&self.rollout) {
            desired.remove(&key);
        }
        if managed.is_empty() {
            desired.remove(MANAGED_ACTIONS_ANNOTATION);
        } else {
            desired.insert(
                MANAGED_ACTIONS_ANNOTATION.to_string(),
                format_managed_actions(&managed),
            );
        }

        self.apply(&current, &desired).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "alb_test.rs"]
mod tests;
