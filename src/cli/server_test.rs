//! Tests for the rollouts API server
//!
//! Each test binds its own port so they can run in parallel.

#![allow(clippy::unwrap_used)]

use super::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

struct StaticRollouts {
    rollouts: Vec<Rollout>,
    failing: AtomicBool,
}

#[async_trait]
impl RolloutSource for StaticRollouts {
    async fn list_rollouts(&self) -> Result<Vec<Rollout>, kube::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "rollouts.rollgate.io is forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }));
        }
        Ok(self.rollouts.clone())
    }
}

fn rollout(name: &str, status: &str) -> Rollout {
    serde_yaml::from_str(&format!(
        r#"
apiVersion: rollgate.io/v1alpha1
kind: Rollout
metadata:
  name: {name}
  namespace: shop
spec:
  paused: true
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
  strategy:
    canary:
      canaryService: {name}-canary
      stableService: {name}-stable
      steps:
      - setWeight: 20
      - pause: {{}}
{status}
"#
    ))
    .unwrap()
}

async fn start(port: u16, source: Arc<StaticRollouts>) -> (JoinHandle<()>, reqwest::Client) {
    let handle = tokio::spawn(run_forever(port, source));
    let client = reqwest::Client::new();

    let mut delay = Duration::from_millis(10);
    for attempt in 1..=10 {
        let probe = client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await;
        match probe {
            Ok(_) => break,
            Err(e) if attempt == 10 => panic!("rollouts server not up: {}", e),
            Err(_) => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
        }
    }
    (handle, client)
}

#[test]
fn test_summary_of_paused_rollout() {
    let r = rollout(
        "cart",
        r#"status:
  currentStepIndex: 1
  currentWeight: 20
  phase: Paused
  message: Paused at step 1"#,
    );
    let summary = RolloutSummary::from(&r);
    assert_eq!(
        serde_json::to_value(&summary).unwrap(),
        json!({
            "name": "cart",
            "namespace": "shop",
            "phase": "Paused",
            "paused": true,
            "currentStepIndex": 1,
            "totalSteps": 2,
            "currentWeight": 20,
            "message": "Paused at step 1"
        })
    );
}

#[test]
fn test_summary_without_status() {
    let summary = RolloutSummary::from(&rollout("cart", ""));
    assert_eq!(summary.current_step_index, 0);
    assert_eq!(summary.current_weight, 0);
    assert_eq!(summary.phase, None);
}

#[tokio::test]
async fn test_lists_rollouts_sorted_by_name() {
    let source = Arc::new(StaticRollouts {
        rollouts: vec![rollout("web", ""), rollout("api", "")],
        failing: AtomicBool::new(false),
    });
    let port = 18190;
    let (handle, client) = start(port, source).await;

    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/rollouts", port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["api", "web"]);

    handle.abort();
}

#[tokio::test]
async fn test_list_failure_is_bad_gateway() {
    let source = Arc::new(StaticRollouts {
        rollouts: vec![],
        failing: AtomicBool::new(true),
    });
    let port = 18191;
    let (handle, client) = start(port, source.clone()).await;

    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/rollouts", port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(response.text().await.unwrap().contains("forbidden"));

    // The server keeps answering once the cluster recovers
    source.failing.store(false, Ordering::SeqCst);
    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/rollouts", port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    handle.abort();
}

#[tokio::test]
async fn test_bind_failure_is_retried() {
    // Occupy the port so the first attempts fail, then release it
    let port = 18192;
    let blocker = std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();
    let source = Arc::new(StaticRollouts {
        rollouts: vec![],
        failing: AtomicBool::new(false),
    });
    let handle = tokio::spawn(run_forever(port, source.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());
    drop(blocker);

    // The retry after RESTART_DELAY binds the freed port
    let client = reqwest::Client::new();
    let mut up = false;
    for _ in 0..30 {
        let probe = client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await;
        if matches!(probe, Ok(ref r) if r.status() == reqwest::StatusCode::OK) {
            up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(up, "server did not come back after the port was released");

    handle.abort();
}
