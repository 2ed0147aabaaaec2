//! Traffic routing
//!
//! Every backend that can split traffic between the stable and canary
//! services implements [`TrafficRoutingReconciler`]. Built-in backends (ALB
//! Ingress annotations, Gateway API HTTPRoutes) run in-process; anything else
//! is reached through an out-of-process plugin that speaks the same contract.

pub mod alb;
pub mod gateway;

use crate::config::ConfigError;
use crate::crd::rollout::Rollout;
use crate::plugin::{PluginClient, PluginError, PluginManager};
use alb::{AlbReconciler, IngressClient, LoadBalancerReader};
use async_trait::async_trait;
use gateway::{GatewayApiReconciler, HttpRouteClient};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// A named service receiving a fixed share of traffic besides canary and stable
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WeightDestination {
    #[serde(rename = "serviceName")]
    pub service_name: String,

    pub weight: i32,

    #[serde(rename = "podTemplateHash", default, skip_serializing_if = "Option::is_none")]
    pub pod_template_hash: Option<String>,
}

/// String comparison used by header and mirror matches
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeaderRoutingMatch {
    #[serde(rename = "headerName")]
    pub header_name: String,
    #[serde(rename = "headerValue")]
    pub header_value: StringMatch,
}

/// Route requests carrying matching headers to the canary
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SetHeaderRoute {
    pub name: String,
    #[serde(rename = "match", default)]
    pub matches: Vec<HeaderRoutingMatch>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<StringMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<StringMatch>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub headers: std::collections::BTreeMap<String, StringMatch>,
}

/// Mirror a percentage of matching requests to the canary
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SetMirrorRoute {
    pub name: String,
    #[serde(rename = "match", default)]
    pub matches: Vec<RouteMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
}

#[derive(Debug, Error)]
pub enum TrafficRoutingError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid weight {weight}: canary and additional destinations must leave 0..=100 for stable")]
    InvalidWeight { weight: i32 },

    #[error("{0}")]
    Misconfigured(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("load balancer lookup failed: {0}")]
    LoadBalancer(String),

    #[error("cluster API call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Capability contract shared by in-process routers and plugin proxies
///
/// Only `set_weight` and `verify_weight` are mandatory; the remaining
/// behaviours default to no-ops for backends that do not support them.
#[async_trait]
pub trait TrafficRoutingReconciler: Send + Sync {
    fn type_name(&self) -> String;

    async fn update_hash(
        &self,
        _canary_hash: &str,
        _stable_hash: &str,
        _additional: &[WeightDestination],
    ) -> Result<(), TrafficRoutingError> {
        Ok(())
    }

    async fn set_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<(), TrafficRoutingError>;

    /// `Ok(false)` means the backend has not converged yet, not a failure
    async fn verify_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<bool, TrafficRoutingError>;

    async fn set_header_route(&self, _route: &SetHeaderRoute) -> Result<(), TrafficRoutingError> {
        Ok(())
    }

    async fn set_mirror_route(&self, _route: &SetMirrorRoute) -> Result<(), TrafficRoutingError> {
        Ok(())
    }

    async fn remove_managed_routes(&self) -> Result<(), TrafficRoutingError> {
        Ok(())
    }
}

/// Weighted targets in backend order: canary, additional destinations, stable
///
/// Stable absorbs whatever is left so the weights always sum to 100.
pub fn weighted_targets(
    canary_service: &str,
    stable_service: &str,
    desired_weight: i32,
    additional: &[WeightDestination],
) -> Result<Vec<(String, i32)>, TrafficRoutingError> {
    if !(0..=100).contains(&desired_weight) {
        return Err(TrafficRoutingError::InvalidWeight {
            weight: desired_weight,
        });
    }

    let mut targets = Vec::with_capacity(additional.len() + 2);
    targets.push((canary_service.to_string(), desired_weight));
    let mut remaining = 100 - desired_weight;
    for dest in additional {
        if !(0..=100).contains(&dest.weight) {
            return Err(TrafficRoutingError::InvalidWeight { weight: dest.weight });
        }
        targets.push((dest.service_name.clone(), dest.weight));
        remaining -= dest.weight;
    }
    if remaining < 0 {
        return Err(TrafficRoutingError::InvalidWeight {
            weight: desired_weight,
        });
    }
    targets.push((stable_service.to_string(), remaining));
    Ok(targets)
}

/// Cluster seams and shared state needed to build reconcilers for a rollout
#[derive(Clone)]
pub struct RoutingBackends {
    pub ingresses: Arc<dyn IngressClient>,
    pub load_balancers: Option<Arc<dyn LoadBalancerReader>>,
    pub http_routes: Arc<dyn HttpRouteClient>,
    pub plugins: Arc<PluginManager>,
    /// Controller-wide default, overridden per rollout by `verifyWeight`
    pub verify_weight: bool,
}

/// Build one reconciler per backend configured on the rollout
///
/// A rollout without traffic routing yields an empty list.
pub fn new_traffic_routing_reconcilers(
    rollout: &Rollout,
    backends: &RoutingBackends,
) -> Result<Vec<Box<dyn TrafficRoutingReconciler>>, TrafficRoutingError> {
    let Some(routing) = rollout.traffic_routing() else {
        return Ok(Vec::new());
    };
    let namespace = rollout
        .namespace()
        .ok_or_else(|| TrafficRoutingError::Misconfigured("rollout has no namespace".to_string()))?;
    let verify = routing.verify_weight.unwrap_or(backends.verify_weight);

    let mut reconcilers: Vec<Box<dyn TrafficRoutingReconciler>> = Vec::new();

    if let Some(alb) = &routing.alb {
        reconcilers.push(Box::new(AlbReconciler::new(
            rollout,
            alb.clone(),
            backends.ingresses.clone(),
            backends.load_balancers.clone(),
            verify,
        )?));
    }

    if let Some(gateway) = &routing.gateway_api {
        reconcilers.push(Box::new(GatewayApiReconciler::new(
            rollout,
            gateway.clone(),
            backends.http_routes.clone(),
            verify,
        )?));
    }

    // Plugin settings travel inside the rollout snapshot each call carries
    for name in routing.plugins.keys() {
        if !backends.plugins.is_configured(name) {
            return Err(ConfigError::PluginNotConfigured(name.clone()).into());
        }
        reconcilers.push(Box::new(PluginClient::new(
            name.clone(),
            rollout.clone(),
            backends.plugins.clone(),
        )));
    }

    tracing::debug!(
        rollout = ?rollout.name_any(),
        namespace = ?namespace,
        count = reconcilers.len(),
        "Built traffic routing reconcilers"
    );

    Ok(reconcilers)
}

/// Canary and stable service names of a rollout's canary strategy
pub(crate) fn canary_services(rollout: &Rollout) -> Result<(String, String), TrafficRoutingError> {
    rollout
        .spec
        .strategy
        .canary
        .as_ref()
        .map(|c| (c.canary_service.clone(), c.stable_service.clone()))
        .ok_or_else(|| {
            TrafficRoutingError::Misconfigured("rollout has no canary strategy".to_string())
        })
}

#[cfg(test)]
#[path = "trafficrouting_test.rs"]
mod tests;
