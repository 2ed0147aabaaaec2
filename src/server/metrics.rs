//! Prometheus metrics for the rollgate controllers
//!
//! - Reconciliation counts and durations per controller
//! - Experiment phase transitions
//! - Canary traffic weight per rollout

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Controller metrics registry
///
/// Clone is cheap (the collectors are reference counted).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Reconciliations by controller and result (success, error)
    pub reconciliations_total: IntCounterVec,
    pub reconciliation_duration_seconds: HistogramVec,
    /// Experiments entering each phase
    pub experiment_phase_total: IntCounterVec,
    /// Canary traffic weight per rollout (0-100)
    pub traffic_weight: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "rollgate_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rollgate_reconciliation_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let experiment_phase_total = IntCounterVec::new(
            Opts::new(
                "rollgate_experiment_phase_total",
                "Number of experiment phase transitions by target phase",
            ),
            &["phase"],
        )?;
        registry.register(Box::new(experiment_phase_total.clone()))?;

        let traffic_weight = IntGaugeVec::new(
            Opts::new(
                "rollgate_traffic_weight",
                "Current canary traffic weight percentage",
            ),
            &["namespace", "rollout"],
        )?;
        registry.register(Box::new(traffic_weight.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            experiment_phase_total,
            traffic_weight,
        })
    }

    pub fn record_reconciliation_success(&self, controller: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[controller, "success"])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[controller])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self, controller: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[controller, "error"])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[controller])
            .observe(duration_secs);
    }

    pub fn record_experiment_phase(&self, phase: &str) {
        self.experiment_phase_total.with_label_values(&[phase]).inc();
    }

    pub fn set_traffic_weight(&self, namespace: &str, rollout: &str, weight: i64) {
        self.traffic_weight
            .with_label_values(&[namespace, rollout])
            .set(weight);
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
