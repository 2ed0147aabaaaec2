#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use kube::CustomResourceExt;

#[test]
fn test_experiment_deserialize_from_yaml() {
    let yaml = r#"
apiVersion: rollgate.io/v1alpha1
kind: Experiment
metadata:
  name: foo
  namespace: default
spec:
  duration: 5m
  scaleDownDelaySeconds: 10
  templates:
  - name: baseline
    replicas: 2
    selector:
      matchLabels:
        app: demo
    template:
      metadata:
        labels:
          app: demo
      spec:
        containers:
        - name: app
          image: nginx:1.0
    service: {}
  - name: canary
    selector:
      matchLabels:
        app: demo
    template:
      metadata:
        labels:
          app: demo
      spec:
        containers:
        - name: app
          image: nginx:2.0
"#;

    let experiment: Experiment = serde_yaml::from_str(yaml).expect("deserialize Experiment");

    assert_eq!(experiment.spec.duration.as_deref(), Some("5m"));
    assert!(!experiment.spec.terminate);
    assert_eq!(experiment.scale_down_delay_seconds(), 10);
    assert_eq!(
        experiment.progress_deadline_seconds(),
        DEFAULT_PROGRESS_DEADLINE_SECONDS
    );
    assert_eq!(experiment.spec.templates.len(), 2);
    assert_eq!(experiment.spec.templates[0].replicas_or_default(), 2);
    assert_eq!(experiment.spec.templates[1].replicas_or_default(), 1);
    assert!(experiment.spec.templates[0].service.is_some());
    assert!(experiment.spec.templates[1].service.is_none());
}

#[test]
fn test_experiment_crd_schema_generation() {
    let crd = Experiment::crd();

    assert_eq!(crd.spec.group, "rollgate.io");
    assert_eq!(crd.spec.names.kind, "Experiment");
    assert_eq!(crd.spec.names.plural, "experiments");
    assert!(crd.spec.versions[0].schema.is_some());
}

#[test]
fn test_phase_completion() {
    assert!(!ExperimentPhase::Pending.is_completed());
    assert!(!ExperimentPhase::Running.is_completed());
    assert!(ExperimentPhase::Successful.is_completed());
    assert!(ExperimentPhase::Inconclusive.is_unsuccessful());
    assert!(!ExperimentPhase::Successful.is_unsuccessful());
}

#[test]
fn test_template_status_severity_orders_error_worst() {
    let mut codes = vec![
        TemplateStatusCode::Running,
        TemplateStatusCode::Error,
        TemplateStatusCode::Successful,
        TemplateStatusCode::Failed,
        TemplateStatusCode::Progressing,
    ];
    codes.sort_by_key(|c| c.severity());
    assert_eq!(
        codes,
        vec![
            TemplateStatusCode::Successful,
            TemplateStatusCode::Running,
            TemplateStatusCode::Progressing,
            TemplateStatusCode::Failed,
            TemplateStatusCode::Error,
        ]
    );
}

#[test]
fn test_status_serializes_camel_case() {
    let status = ExperimentStatus {
        phase: Some(ExperimentPhase::Running),
        available_at: Some("2025-01-01T00:00:00Z".to_string()),
        template_statuses: vec![TemplateStatus {
            service_name: Some("foo-bar-abc".to_string()),
            ..TemplateStatus::new("bar")
        }],
        ..Default::default()
    };

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["phase"], "Running");
    assert_eq!(json["availableAt"], "2025-01-01T00:00:00Z");
    assert_eq!(json["templateStatuses"][0]["serviceName"], "foo-bar-abc");
    assert_eq!(json["templateStatuses"][0]["status"], "Progressing");
}
