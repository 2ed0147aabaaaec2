//! Traffic routing contract forwarded to a plugin

use super::manager::PluginManager;
use super::protocol::{
    HeaderRouteArgs, MirrorRouteArgs, Request, Response, RolloutArgs, UpdateHashArgs, WeightArgs,
};
use super::PluginError;
use crate::crd::rollout::Rollout;
use crate::trafficrouting::{
    SetHeaderRoute, SetMirrorRoute, TrafficRoutingError, TrafficRoutingReconciler, WeightDestination,
};
use async_trait::async_trait;
use std::sync::Arc;

pub struct PluginClient {
    name: String,
    rollout: Rollout,
    manager: Arc<PluginManager>,
}

impl PluginClient {
    pub fn new(name: String, rollout: Rollout, manager: Arc<PluginManager>) -> Self {
        PluginClient {
            name,
            rollout,
            manager,
        }
    }

    async fn ack(&self, request: Request) -> Result<(), TrafficRoutingError> {
        let method = request.method();
        match self.manager.call(&self.name, request).await? {
            Response::Ack { error } => Ok(error.into_result()?),
            other => Err(unexpected(method, other)),
        }
    }

    /// Type reported by the plugin itself
    pub async fn remote_type(&self) -> Result<String, TrafficRoutingError> {
        match self.manager.call(&self.name, Request::Type).await? {
            Response::Type { name } => Ok(name),
            other => Err(unexpected("Type", other)),
        }
    }

    fn weight_args(&self, desired_weight: i32, additional: &[WeightDestination]) -> WeightArgs {
        WeightArgs {
            rollout: self.rollout.clone(),
            desired_weight,
            additional_destinations: additional.to_vec(),
        }
    }
}

fn unexpected(method: &'static str, response: Response) -> TrafficRoutingError {
    PluginError::UnexpectedResponse {
        method,
        detail: format!("{:?}", response),
    }
    .into()
}

#[async_trait]
impl TrafficRoutingReconciler for PluginClient {
    fn type_name(&self) -> String {
        self.name.clone()
    }

    async fn update_hash(
        &self,
        canary_hash: &str,
        stable_hash: &str,
        additional: &[WeightDestination],
    ) -> Result<(), TrafficRoutingError> {
        self.ack(Request::UpdateHash(UpdateHashArgs {
            rollout: self.rollout.clone(),
            canary_hash: canary_hash.to_string(),
            stable_hash: stable_hash.to_string(),
            additional_destinations: additional.to_vec(),
        }))
        .await
    }

    async fn set_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<(), TrafficRoutingError> {
        self.ack(Request::SetWeight(self.weight_args(desired_weight, additional)))
            .await
    }

    async fn verify_weight(
        &self,
        desired_weight: i32,
        additional: &[WeightDestination],
    ) -> Result<bool, TrafficRoutingError> {
        let request = Request::VerifyWeight(self.weight_args(desired_weight, additional));
        match self.manager.call(&self.name, request).await? {
            Response::Verified { verified, error } => {
                error.into_result()?;
                Ok(verified)
            }
            other => Err(unexpected("VerifyWeight", other)),
        }
    }

    async fn set_header_route(&self, route: &SetHeaderRoute) -> Result<(), TrafficRoutingError> {
        self.ack(Request::SetHeaderRoute(HeaderRouteArgs {
            rollout: self.rollout.clone(),
            header_route: route.clone(),
        }))
        .await
    }

    async fn set_mirror_route(&self, route: &SetMirrorRoute) -> Result<(), TrafficRoutingError> {
        self.ack(Request::SetMirrorRoute(MirrorRouteArgs {
            rollout: self.rollout.clone(),
            mirror_route: route.clone(),
        }))
        .await
    }

    async fn remove_managed_routes(&self) -> Result<(), TrafficRoutingError> {
        self.ack(Request::RemoveManagedRoutes(RolloutArgs {
            rollout: self.rollout.clone(),
        }))
        .await
    }
}
