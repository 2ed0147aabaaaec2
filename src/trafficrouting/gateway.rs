//! Gateway API traffic routing
//!
//! Splits traffic by rewriting the weighted `backendRefs` of the first rule
//! of an `HTTPRoute`. The route is handled as a `DynamicObject` so the rest
//! of its rules and any fields this crate does not model survive the patch.

use super::{canary_services, weighted_targets, TrafficRoutingError, TrafficRoutingReconciler, WeightDestination};
use crate::crd::rollout::{GatewayAPIRouting, Rollout};
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRouteRulesBackendRefs;
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub fn http_route_resource() -> ApiResource {
    ApiResource {
        group: "gateway.networking.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "gateway.networking.k8s.io/v1".to_string(),
        kind: "HTTPRoute".to_string(),
        plural: "httproutes".to_string(),
    }
}

#[async_trait]
pub trait HttpRouteClient: Send + Sync {
    async fn get_http_route(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, TrafficRoutingError>;

    async fn patch_http_route(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), TrafficRoutingError>;
}

pub struct KubeHttpRouteClient {
    client: kube::Client,
    timeout: Duration,
}

impl KubeHttpRouteClient {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        KubeHttpRouteClient { client, timeout }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &http_route_resource())
    }
}

#[async_trait]
impl HttpRouteClient for KubeHttpRouteClient {
    async fn get_http_route(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, TrafficRoutingError> {
        tokio::time::timeout(self.timeout, self.api(namespace).get_opt(name))
            .await
            .map_err(|_| TrafficRoutingError::Timeout(self.timeout))?
            .map_err(TrafficRoutingError::from)
    }

    async fn patch_http_route(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), TrafficRoutingError> {
        let api = self.api(namespace);
        tokio::time::timeout(
            self.timeout,
            api.patch(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await
        .map_err(|_| TrafficRoutingError::Timeout(self.timeout))??;
        Ok(())
    }
}

fn route_rules(route: &DynamicObject) -> Vec<Value> {
    route
        .data
        .pointer("/spec/rules")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// `(service, weight)` pairs of a rule's backend refs, weight defaulting to 1
fn backend_weights(rule: &Value) -> Vec<(String, i32)> {
    rule.get("backendRefs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let name = r.get("name")?.as_str()?.to_string();
            let weight = r
                .get("weight")
                .and_then(Value::as_i64)
                .map(|w| w as i32)
                .unwrap_or(1);
            Some((name, weight))
        })
        .collect()
}

fn backend_port(rule: &Value, service: &str) -> Option<i32> {
    let refs = rule.get("backendRefs").and_then(Value::as_array)?;
    let port_of = |r: &Value| r.get("port").and_then(Value::as_i64).map(|p| p as i32);
    refs.iter()
        .find(|r| r.get("name").and_then(Value::as_str) == Some(service))
        .and_then(port_of)
        .or_else(|| refs.iter().find_map(port_of))
}

/// A parent gateway has accepted the route
fn is_accepted(route: &DynamicObject) -> bool {
    route
        .data
        .pointer("/status/parents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("conditions").and_then(Value::as_array))
        .flatten()
        .any(|c| {
            c.get("type").and_then(Value::as_str) == Some("Accepted")
                && c.get("status").and_then(Value::as_str) == Some("True")
        })
}

pub struct GatewayApiReconciler {
    rollout: String,
    namespace: String,
    canary_service: String,
    stable_service: String,
    config: GatewayAPIRouting,
    routes: Arc<dyn HttpRouteClient>,
    verify: bool,
}

impl GatewayApiReconciler {
    pub fn new(
        rollout: &Rollout,
        config: GatewayAPIRouting,
        routes: Arc<dyn HttpRouteClient>,
        verify: bool,
    ) -> Result<Self, TrafficRoutingError> {
        let (canary_service, stable_service) = canary_services(rollout)?;
        let namespace = rollout
            .namespace()
            .ok_or_else(|| TrafficRoutingError::Misconfigured("rollout has no namespace".to_string()))?;
        Ok(GatewayApiReconciler {
            rollout: rollout.name_any(),
            namespace,
            canary_service,
            stable_service,
            config,
            routes,
            verify,
        })
    }

    async fn route(&self) -> Result<DynamicObject, TrafficRoutingError> {
        self.routes
            .get_http_route(&self.namespace, &self.config.http_route)
            .await?
            .ok_or_else(|| TrafficRoutingError::NotFound(format!("httproute/{}", self.config.http_route)))
    }

    /// Weighted backend refs for the first rule
    pub fn backend_refs(
        &self,
        first_rule: &Value,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<Vec<HTTPRouteRulesBackendRefs>, TrafficRoutingError> {
        Ok(weighted_targets(
            &self.canary_service,
            &self.stable_service,
            desired_weight,
            additional,
        )?
        .into_iter()
        .map(|(name, weight)| HTTPRouteRulesBackendRefs {
            port: backend_port(first_rule, &name),
            name,
            weight: Some(weight),
            kind: Some("Service".to_string()),
            group: Some("".to_string()),
            namespace: None,
            filters: None,
        })
        .collect())
    }
}

#[async_trait]
impl TrafficRoutingReconciler for GatewayApiReconciler {
    fn type_name(&self) -> String {
        "GatewayAPI".to_string()
    }

    async fn set_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<(), TrafficRoutingError> {
        let route = self.route().await?;
        let mut rules = route_rules(&route);
        let Some(first) = rules.first_mut() else {
            return Err(TrafficRoutingError::Misconfigured(format!(
                "httproute `{}` has no rules",
                self.config.http_route
            )));
        };

        let refs = self.backend_refs(first, desired_weight, additional)?;
        let desired: Vec<(String, i32)> = refs
            .iter()
            .map(|r| (r.name.clone(), r.weight.unwrap_or(1)))
            .collect();
        if backend_weights(first) == desired {
            debug!(rollout = ?self.rollout, httproute = ?self.config.http_route, "HTTPRoute already at desired weights");
            return Ok(());
        }

        first["backendRefs"] = serde_json::to_value(&refs)?;
        // Merge patch replaces the whole rules list; the version guards against lost updates
        let patch = json!({
            "metadata": { "resourceVersion": route.resource_version() },
            "spec": { "rules": rules }
        });
        self.routes
            .patch_http_route(&self.namespace, &self.config.http_route, &patch)
            .await?;

        info!(
            rollout = ?self.rollout,
            httproute = ?self.config.http_route,
            desired_weight,
            "HTTPRoute updated with weighted backends"
        );
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

        let route = self.route().await?;
        if !is_accepted(&route) {
            info!(httproute = ?self.config.http_route, "HTTPRoute not yet accepted by a gateway");
            return Ok(false);
        }

        let rules = route_rules(&route);
        let Some(first) = rules.first() else {
            return Ok(false);
        };
        let desired: Vec<(String, i32)> = weighted_targets(
            &self.canary_service,
            &self.stable_service,
            desired_weight,
            additional,
        )?;
        Ok(backend_weights(first) == desired)
    }
}

#[cfg(test)]
#[path = "gateway_test.rs"]
mod tests;
