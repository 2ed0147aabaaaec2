//! Rollout reconciler
//!
//! Walks the canary steps of a Rollout: `setWeight` steps shift traffic
//! through every configured router and advance only once the weight is
//! verified, pause steps hold until the pause engine says they completed.

use crate::config::ControllerConfig;
use crate::controller::clock::Clock;
use crate::controller::experiment::client::ClientError;
use crate::controller::experiment::replicaset::compute_pod_template_hash;
use crate::controller::pause::{
    calculate_pause_status, check_enqueue_rollout_during_pause, completed_pause_step,
};
use crate::controller::validation::validate_rollout;
use crate::controller::ReconcileError;
use crate::crd::rollout::{Phase, Rollout, RolloutStatus};
use crate::server::SharedMetrics;
use crate::trafficrouting::{
    new_traffic_routing_reconcilers, RoutingBackends, TrafficRoutingError, TrafficRoutingReconciler,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wait before re-checking a weight that has not been verified yet
const VERIFY_RETRY: Duration = Duration::from_secs(10);

/// Writes the Rollout reconciler makes back to the cluster
#[async_trait]
pub trait RolloutClient: Send + Sync {
    async fn patch_paused(&self, namespace: &str, name: &str, paused: bool) -> Result<(), ClientError>;

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RolloutStatus,
    ) -> Result<(), ClientError>;
}

pub struct KubeRolloutClient {
    client: kube::Client,
    timeout: Duration,
}

impl KubeRolloutClient {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        KubeRolloutClient { client, timeout }
    }

    async fn bounded<T, F>(&self, object: &str, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| ClientError::from_kube(e, object)),
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl RolloutClient for KubeRolloutClient {
    async fn patch_paused(&self, namespace: &str, name: &str, paused: bool) -> Result<(), ClientError> {
        let api: Api<Rollout> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "paused": paused } });
        self.bounded(
            &format!("rollout/{}", name),
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RolloutStatus,
    ) -> Result<(), ClientError> {
        let api: Api<Rollout> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        self.bounded(
            &format!("rollout/{}", name),
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

pub struct Context {
    pub client: Arc<dyn RolloutClient>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    pub routing: RoutingBackends,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: Arc<dyn RolloutClient>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        routing: RoutingBackends,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            client,
            clock,
            config,
            routing,
            metrics,
        }
    }
}

/// Result of walking the steps once
struct StepOutcome {
    requeue_after: Option<Duration>,
}

/// Reconcile a Rollout
pub async fn reconcile(rollout: Arc<Rollout>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_inner(&rollout, &ctx).await;

    if let Some(metrics) = &ctx.metrics {
        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics.record_reconciliation_success("rollout", elapsed),
            Err(_) => metrics.record_reconciliation_error("rollout", elapsed),
        }
    }

    result
}

async fn reconcile_inner(rollout: &Rollout, ctx: &Context) -> Result<Action, ReconcileError> {
    let namespace = rollout
        .namespace()
        .ok_or(ReconcileError::MissingNamespace { kind: "Rollout" })?;
    let name = rollout.name_any();
    let now = ctx.clock.now();

    info!(rollout = ?name, namespace = ?namespace, "Reconciling Rollout");

    let previous = rollout.status.clone().unwrap_or_default();
    let mut working = rollout.clone();

    let outcome = match validate_rollout(rollout) {
        Ok(()) => match advance(&mut working, ctx, now).await {
            Ok(outcome) => outcome,
            Err(ReconcileError::TrafficRouting(e)) if is_configuration_error(&e) => {
                degrade(&mut working, e.to_string());
                StepOutcome { requeue_after: None }
            }
            Err(e) => return Err(e),
        },
        Err(message) => {
            degrade(&mut working, message);
            StepOutcome { requeue_after: None }
        }
    };

    if working.spec.paused != rollout.spec.paused {
        info!(rollout = ?name, paused = working.spec.paused, "Updating spec.paused");
        ctx.client
            .patch_paused(&namespace, &name, working.spec.paused)
            .await?;
    }

    let status = working.status.unwrap_or_default();
    if status != previous {
        ctx.client.patch_status(&namespace, &name, &status).await?;
        if status.phase != previous.phase {
            info!(rollout = ?name, phase = ?status.phase, message = ?status.message, "Rollout phase changed");
        }
    } else {
        debug!(rollout = ?name, "Rollout status unchanged, skipping patch");
    }

    if let (Some(metrics), Some(weight)) = (&ctx.metrics, status.current_weight) {
        metrics.set_traffic_weight(&namespace, &name, i64::from(weight));
    }

    Ok(match outcome.requeue_after {
        Some(delay) => {
            debug!(rollout = ?name, requeue_after = ?delay, "Scheduling requeue");
            Action::requeue(delay)
        }
        None => Action::requeue(ctx.config.resync_period),
    })
}

/// Missing or malformed routing configuration cannot be fixed by retrying
fn is_configuration_error(err: &TrafficRoutingError) -> bool {
    matches!(
        err,
        TrafficRoutingError::Config(_)
            | TrafficRoutingError::NotFound(_)
            | TrafficRoutingError::Misconfigured(_)
            | TrafficRoutingError::InvalidWeight { .. }
    )
}

fn degrade(rollout: &mut Rollout, message: String) {
    warn!(rollout = ?rollout.name_any(), message = %message, "Rollout is degraded");
    let status = rollout.status.get_or_insert_with(Default::default);
    status.phase = Some(Phase::Degraded);
    status.message = Some(message);
}

/// Walk steps from the current index until one has to wait
///
/// Mutates `working.status` (and `working.spec.paused`) in place; the caller
/// diffs against the observed object and writes only what changed.
async fn advance(
    working: &mut Rollout,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<StepOutcome, ReconcileError> {
    let name = working.name_any();
    let canary_hash = compute_pod_template_hash(&working.spec.template, None, None)?;
    let steps = working.steps().to_vec();

    {
        let status = working.status.get_or_insert_with(Default::default);
        if status.canary_hash.as_deref() != Some(canary_hash.as_str()) {
            if status.stable_hash.is_none() {
                // First revision has nothing to compare against
                info!(rollout = ?name, hash = %canary_hash, "Initial revision, skipping canary steps");
                status.stable_hash = Some(canary_hash.clone());
                status.current_step_index = Some(steps.len() as i32);
            } else {
                info!(rollout = ?name, hash = %canary_hash, "New revision detected, restarting canary steps");
                status.current_step_index = Some(0);
                status.current_weight = Some(0);
                status.pause_start_time = None;
            }
            status.canary_hash = Some(canary_hash.clone());
            status.phase = Some(Phase::Progressing);
            status.message = None;
        }
    }

    let routers = new_traffic_routing_reconcilers(working, &ctx.routing)?;
    let stable_hash = working
        .status
        .as_ref()
        .and_then(|s| s.stable_hash.clone())
        .unwrap_or_else(|| canary_hash.clone());

    // A user pause outside a pause step freezes the rollout where it is
    let pause_recorded = working
        .status
        .as_ref()
        .and_then(|s| s.pause_start_time.as_ref())
        .is_some();
    let index = current_index(working);
    let at_pause_step = steps.get(index).map(|s| s.pause.is_some()).unwrap_or(false);
    if working.spec.paused && !pause_recorded && !at_pause_step {
        set_phase(working, Phase::Paused, "Rollout paused by user");
        return Ok(StepOutcome { requeue_after: None });
    }

    for _ in 0..=steps.len() {
        let index = current_index(working);

        let Some(step) = steps.get(index) else {
            if !apply_weight(&routers, 100, &canary_hash, &stable_hash).await? {
                set_phase(working, Phase::Progressing, "Waiting for full promotion weight to be verified");
                return Ok(StepOutcome {
                    requeue_after: Some(VERIFY_RETRY),
                });
            }
            let status = working.status.get_or_insert_with(Default::default);
            status.current_weight = Some(100);
            status.stable_hash = Some(canary_hash.clone());
            status.phase = Some(Phase::Healthy);
            status.message = Some("Rollout completed".to_string());
            return Ok(StepOutcome { requeue_after: None });
        };

        if let Some(weight) = step.set_weight {
            if !apply_weight(&routers, weight, &canary_hash, &stable_hash).await? {
                set_phase(
                    working,
                    Phase::Progressing,
                    &format!("Waiting for weight {} to be verified", weight),
                );
                return Ok(StepOutcome {
                    requeue_after: Some(VERIFY_RETRY),
                });
            }
            let status = working.status.get_or_insert_with(Default::default);
            status.current_weight = Some(weight);
            info!(rollout = ?name, step = index, weight, "Traffic weight applied");
            advance_index(working);
            continue;
        }

        if let Some(pause) = &step.pause {
            if completed_pause_step(working, pause, now) {
                info!(rollout = ?name, step = index, "Pause step completed");
                working.spec.paused = false;
                if let Some(status) = working.status.as_mut() {
                    status.pause_start_time = None;
                }
                advance_index(working);
                continue;
            }

            let pause_status = calculate_pause_status(working, true, now);
            working.spec.paused = pause_status.paused;
            working
                .status
                .get_or_insert_with(Default::default)
                .pause_start_time = pause_status.pause_start_time;
            set_phase(working, Phase::Paused, &format!("Paused at step {}", index));

            let requeue_after =
                check_enqueue_rollout_during_pause(working, pause, ctx.config.resync_period, now);
            return Ok(StepOutcome { requeue_after });
        }

        // A step with nothing to do
        advance_index(working);
    }

    Ok(StepOutcome { requeue_after: None })
}

/// Push the weight to every router; true once all of them verified it
async fn apply_weight(
    routers: &[Box<dyn TrafficRoutingReconciler>],
    weight: i32,
    canary_hash: &str,
    stable_hash: &str,
) -> Result<bool, ReconcileError> {
    let mut verified = true;
    for router in routers {
        router.update_hash(canary_hash, stable_hash, &[]).await?;
        router.set_weight(weight, &[]).await?;
        if !router.verify_weight(weight, &[]).await? {
            info!(router = %router.type_name(), weight, "Weight not verified yet");
            verified = false;
        }
    }
    Ok(verified)
}

fn current_index(rollout: &Rollout) -> usize {
    rollout
        .status
        .as_ref()
        .and_then(|s| s.current_step_index)
        .map(|i| i.max(0) as usize)
        .unwrap_or(0)
}

fn advance_index(rollout: &mut Rollout) {
    let next = current_index(rollout) as i32 + 1;
    rollout
        .status
        .get_or_insert_with(Default::default)
        .current_step_index = Some(next);
}

fn set_phase(rollout: &mut Rollout, phase: Phase, message: &str) {
    let status = rollout.status.get_or_insert_with(Default::default);
    status.phase = Some(phase);
    status.message = Some(message.to_string());
}

/// Failed reconciles are retried after a fixed delay
pub fn error_policy(rollout: Arc<Rollout>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(
        rollout = ?rollout.name_any(),
        error = %error,
        "Rollout reconcile error (will retry)"
    );
    Action::requeue(Duration::from_secs(10))
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
