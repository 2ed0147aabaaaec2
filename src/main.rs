use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use rollgate::config::ControllerConfig;
use rollgate::controller::clock::SystemClock;
use rollgate::controller::experiment::{self, client::KubeExperimentClient};
use rollgate::controller::rollout::{self, KubeRolloutClient};
use rollgate::crd::experiment::Experiment;
use rollgate::crd::rollout::Rollout;
use rollgate::plugin::{PluginManager, ProcessLauncher};
use rollgate::server::{create_metrics, run_health_server, ReadinessState};
use rollgate::trafficrouting::alb::KubeIngressClient;
use rollgate::trafficrouting::gateway::KubeHttpRouteClient;
use rollgate::trafficrouting::RoutingBackends;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting rollgate progressive delivery controller");

    let config = match ControllerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid controller configuration");
            return Err(e.into());
        }
    };
    info!(
        resync = ?config.resync_period,
        plugins = config.plugins.len(),
        verify_weight = config.verify_weight,
        "Configuration loaded"
    );

    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = health_port, "Health server task spawned");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let plugins = Arc::new(PluginManager::new(
        config.clone(),
        Arc::new(ProcessLauncher::new(config.plugin_timeout)),
    ));

    // No load balancer API client is wired, ALB verification compares annotations
    let routing = RoutingBackends {
        ingresses: Arc::new(KubeIngressClient::new(client.clone(), config.api_timeout)),
        load_balancers: None,
        http_routes: Arc::new(KubeHttpRouteClient::new(client.clone(), config.api_timeout)),
        plugins: plugins.clone(),
        verify_weight: config.verify_weight,
    };

    let rollout_ctx = Arc::new(rollout::Context::new(
        Arc::new(KubeRolloutClient::new(client.clone(), config.api_timeout)),
        Arc::new(SystemClock),
        config.clone(),
        routing,
        Some(metrics.clone()),
    ));
    let experiment_ctx = Arc::new(experiment::Context::new(
        Arc::new(KubeExperimentClient::new(client.clone(), config.api_timeout)),
        Arc::new(SystemClock),
        config.clone(),
        Some(metrics.clone()),
    ));

    let rollouts = Controller::new(Api::<Rollout>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(rollout::reconcile, rollout::error_policy, rollout_ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled rollout: {:?}", o);
            }
        });

    let experiments =
        Controller::new(Api::<Experiment>::all(client.clone()), watcher::Config::default())
            .owns(Api::<ReplicaSet>::all(client.clone()), watcher::Config::default())
            .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
            .shutdown_on_signal()
            .run(experiment::reconcile, experiment::error_policy, experiment_ctx)
            .for_each(|res| async move {
                if let Ok(o) = res {
                    info!("Reconciled experiment: {:?}", o);
                }
            });

    readiness.set_ready();
    info!("Controllers ready, starting reconciliation loops");

    // error_policy already logs failures, only successes are logged here
    tokio::join!(rollouts, experiments);

    info!("Controllers stopped, shutting down plugins");
    plugins.shutdown().await;

    Ok(())
}
