//! Experiment reconciler
//!
//! Runs each template of an Experiment as its own ReplicaSet (plus an
//! optional Service), tracks readiness, and drives the experiment to a
//! terminal phase with a delayed scale-down.

pub mod client;
pub mod context;
pub mod replicaset;
pub mod service;
pub mod status;

use crate::config::ControllerConfig;
use crate::controller::clock::Clock;
use crate::controller::ReconcileError;
use crate::crd::experiment::Experiment;
use crate::server::SharedMetrics;
use client::ExperimentClient;
use context::ExperimentContext;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Context {
    pub client: Arc<dyn ExperimentClient>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: Arc<dyn ExperimentClient>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            client,
            clock,
            config,
            metrics,
        }
    }
}

/// Reconcile an Experiment
///
/// Children are converged first; the experiment status is patched only when
/// the freshly computed value differs from the observed one.
pub async fn reconcile(
    experiment: Arc<Experiment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_inner(&experiment, &ctx).await;

    if let Some(metrics) = &ctx.metrics {
        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics.record_reconciliation_success("experiment", elapsed),
            Err(_) => metrics.record_reconciliation_error("experiment", elapsed),
        }
    }

    result
}

async fn reconcile_inner(experiment: &Experiment, ctx: &Context) -> Result<Action, ReconcileError> {
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace { kind: "Experiment" })?;
    let name = experiment.name_any();
    let now = ctx.clock.now();

    info!(experiment = ?name, namespace = ?namespace, "Reconciling Experiment");

    let outcome = ExperimentContext::new(experiment, ctx.client.as_ref(), now)?
        .reconcile()
        .await?;

    let previous = experiment.status.clone().unwrap_or_default();
    if outcome.status != previous {
        ctx.client
            .patch_experiment_status(&namespace, &name, &outcome.status)
            .await?;

        if outcome.status.phase != previous.phase {
            if let Some(phase) = outcome.status.phase {
                info!(experiment = ?name, phase = %phase, "Experiment phase changed");
                if let Some(metrics) = &ctx.metrics {
                    metrics.record_experiment_phase(&phase.to_string());
                }
            }
        }
    } else {
        debug!(experiment = ?name, "Experiment status unchanged, skipping patch");
    }

    Ok(match outcome.requeue_after {
        Some(delay) => {
            debug!(experiment = ?name, requeue_after = ?delay, "Scheduling requeue");
            Action::requeue(delay)
        }
        None => Action::requeue(ctx.config.resync_period),
    })
}

/// Failed reconciles are retried after a fixed delay
pub fn error_policy(experiment: Arc<Experiment>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(
        experiment = ?experiment.name_any(),
        error = %error,
        "Experiment reconcile error (will retry)"
    );
    Action::requeue(Duration::from_secs(10))
}

#[cfg(test)]
pub(crate) mod fake;

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
