//! Read-only rollout API for dashboards
//!
//! - `GET /api/v1/rollouts` - summaries of the rollouts in one namespace
//! - `/healthz` - Liveness

use crate::crd::rollout::{Phase, Rollout};
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const DEFAULT_PORT: u16 = 3100;

/// Delay before the serving loop is restarted after a failure
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Where the server reads rollouts from
#[async_trait]
pub trait RolloutSource: Send + Sync {
    async fn list_rollouts(&self) -> Result<Vec<Rollout>, kube::Error>;
}

pub struct KubeRolloutSource {
    api: Api<Rollout>,
}

impl KubeRolloutSource {
    pub fn new(api: Api<Rollout>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RolloutSource for KubeRolloutSource {
    async fn list_rollouts(&self) -> Result<Vec<Rollout>, kube::Error> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub paused: bool,
    pub current_step_index: i32,
    pub total_steps: usize,
    pub current_weight: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&Rollout> for RolloutSummary {
    fn from(rollout: &Rollout) -> Self {
        let status = rollout.status.clone().unwrap_or_default();
        RolloutSummary {
            name: rollout.name_any(),
            namespace: rollout.namespace(),
            phase: status.phase,
            paused: rollout.spec.paused,
            current_step_index: status.current_step_index.unwrap_or(0),
            total_steps: rollout.steps().len(),
            current_weight: status.current_weight.unwrap_or(0),
            stable_hash: status.stable_hash,
            canary_hash: status.canary_hash,
            message: status.message,
        }
    }
}

type SharedSource = Arc<dyn RolloutSource>;

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn list_rollouts(
    State(source): State<SharedSource>,
) -> Result<Json<Vec<RolloutSummary>>, (StatusCode, String)> {
    match source.list_rollouts().await {
        Ok(rollouts) => {
            let mut summaries: Vec<RolloutSummary> =
                rollouts.iter().map(RolloutSummary::from).collect();
            summaries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Json(summaries))
        }
        Err(e) => {
            error!(error = %e, "Failed to list rollouts");
            Err((StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

pub fn router(source: SharedSource) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/rollouts", get(list_rollouts))
        .with_state(source)
}

/// Serve until the listener fails
pub async fn run_server(port: u16, source: SharedSource) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Rollouts server listening");

    axum::serve(listener, router(source))
        .await
        .map_err(std::io::Error::other)
}

/// Keep the server up, restarting it after `RESTART_DELAY` whenever it stops
pub async fn run_forever(port: u16, source: SharedSource) {
    loop {
        match run_server(port, source.clone()).await {
            Ok(()) => warn!(port = %port, "Rollouts server stopped, restarting"),
            Err(e) => error!(port = %port, error = %e, "Rollouts server failed, restarting"),
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod tests;
