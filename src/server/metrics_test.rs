//! Tests for controller metrics

use super::metrics::{create_metrics, ControllerMetrics};

#[test]
fn test_metrics_creation() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    // Prometheus only outputs metrics with values
    metrics.record_reconciliation_success("rollout", 0.1);
    metrics.record_experiment_phase("Running");
    metrics.set_traffic_weight("default", "test", 50);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("rollgate_reconciliations_total"));
    assert!(output.contains("rollgate_reconciliation_duration_seconds"));
    assert!(output.contains("rollgate_experiment_phase_total"));
    assert!(output.contains("rollgate_traffic_weight"));
}

#[test]
fn test_reconciliations_labelled_by_controller() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_reconciliation_success("rollout", 0.5);
    metrics.record_reconciliation_success("rollout", 1.2);
    metrics.record_reconciliation_success("experiment", 0.3);
    metrics.record_reconciliation_error("experiment", 2.0);

    let output = metrics.encode().expect("should encode metrics");

    assert!(output
        .contains("rollgate_reconciliations_total{controller=\"rollout\",result=\"success\"} 2"));
    assert!(output
        .contains("rollgate_reconciliations_total{controller=\"experiment\",result=\"error\"} 1"));
    assert!(output
        .contains("rollgate_reconciliation_duration_seconds_count{controller=\"experiment\"} 2"));
}

#[test]
fn test_experiment_phase_counter() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_experiment_phase("Pending");
    metrics.record_experiment_phase("Successful");
    metrics.record_experiment_phase("Successful");

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("rollgate_experiment_phase_total{phase=\"Successful\"} 2"));
}

#[test]
fn test_set_traffic_weight_overwrites() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.set_traffic_weight("default", "my-app", 25);
    metrics.set_traffic_weight("default", "my-app", 75);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("rollgate_traffic_weight{namespace=\"default\",rollout=\"my-app\"} 75"));
}

#[test]
fn test_shared_metrics_clone_shares_registry() {
    let metrics = create_metrics().expect("should create metrics");
    let clone = metrics.clone();

    clone.record_reconciliation_success("rollout", 0.1);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output
        .contains("rollgate_reconciliations_total{controller=\"rollout\",result=\"success\"} 1"));
}
