#![allow(clippy::unwrap_used)]

use super::*;
use crate::crd::rollout::Rollout;
use std::sync::Mutex;

/// Ingress store that applies annotation merge patches
#[derive(Default)]
struct FakeIngresses {
    ingress: Mutex<Option<Ingress>>,
    patches: Mutex<Vec<Value>>,
}

impl FakeIngresses {
    fn with(ingress: Ingress) -> Arc<Self> {
        Arc::new(FakeIngresses {
            ingress: Mutex::new(Some(ingress)),
            patches: Mutex::default(),
        })
    }

    fn patches(&self) -> Vec<Value> {
        self.patches.lock().unwrap().clone()
    }

    fn annotation(&self, key: &str) -> Option<String> {
        self.ingress
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|i| i.annotations().get(key).cloned())
    }
}

#[async_trait]
impl IngressClient for FakeIngresses {
    async fn get_ingress(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<Ingress>, TrafficRoutingError> {
        Ok(self.ingress.lock().unwrap().clone())
    }

    async fn patch_ingress(
        &self,
        _namespace: &str,
        _name: &str,
        patch: &Value,
    ) -> Result<(), TrafficRoutingError> {
        self.patches.lock().unwrap().push(patch.clone());
        let mut guard = self.ingress.lock().unwrap();
        let ingress = guard.as_mut().unwrap();
        let annotations = ingress.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in patch["metadata"]["annotations"].as_object().unwrap() {
            match value {
                Value::String(v) => {
                    annotations.insert(key.clone(), v.clone());
                }
                _ => {
                    annotations.remove(key);
                }
            }
        }
        Ok(())
    }
}

/// Load balancer whose target groups mirror the Ingress forward action,
/// the way the AWS controller eventually reconciles them
struct ReflectingLoadBalancer {
    ingresses: Arc<FakeIngresses>,
    action_key: String,
    known: bool,
}

#[async_trait]
impl LoadBalancerReader for ReflectingLoadBalancer {
    async fn find_load_balancer_by_dns_name(
        &self,
        dns_name: &str,
    ) -> Result<Option<LoadBalancer>, TrafficRoutingError> {
        Ok(self.known.then(|| LoadBalancer {
            arn: "arn:aws:elasticloadbalancing:lb/app/checkout".to_string(),
            dns_name: dns_name.to_string(),
        }))
    }

    async fn target_groups(
        &self,
        _load_balancer_arn: &str,
    ) -> Result<Vec<TargetGroup>, TrafficRoutingError> {
        let Some(raw) = self.ingresses.annotation(&self.action_key) else {
            return Ok(Vec::new());
        };
        let action: AlbAction = serde_json::from_str(&raw).unwrap();
        Ok(action
            .forward_config
            .target_groups
            .into_iter()
            .map(|tg| TargetGroup {
                arn: format!("arn:tg/{}", tg.service_name),
                resource_id: Some(target_group_resource_id(
                    "default",
                    "checkout-ingress",
                    &tg.service_name,
                    80,
                )),
                weight: tg.weight.map(|w| w as i32),
            })
            .collect())
    }
}

fn rollout() -> Rollout {
    serde_yaml::from_str(
        r#"
apiVersion: rollgate.io/v1alpha1
kind: Rollout
metadata:
  name: checkout
  namespace: default
spec:
  replicas: 3
  selector:
    matchLabels:
      app: checkout
  template:
    metadata:
      labels:
        app: checkout
  strategy:
    canary:
      canaryService: checkout-canary
      stableService: checkout-stable
      trafficRouting:
        alb:
          ingress: checkout-ingress
          servicePort: 80
      steps:
        - setWeight: 20
"#,
    )
    .unwrap()
}

fn ingress(hostname: Option<&str>) -> Ingress {
    let mut value = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": "checkout-ingress",
            "namespace": "default",
            "annotations": { "kubernetes.io/ingress.class": "alb" }
        },
        "spec": {
            "rules": [{
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": { "name": "checkout-stable", "port": { "name": "use-annotation" } }
                        }
                    }]
                }
            }]
        }
    });
    if let Some(host) = hostname {
        value["status"] = json!({ "loadBalancer": { "ingress": [{ "hostname": host }] } });
    }
    serde_json::from_value(value).unwrap()
}

fn alb_config() -> AlbTrafficRouting {
    rollout().traffic_routing().unwrap().alb.clone().unwrap()
}

fn reconciler(
    ingresses: Arc<FakeIngresses>,
    load_balancers: Option<Arc<dyn LoadBalancerReader>>,
    verify: bool,
) -> AlbReconciler {
    AlbReconciler::new(&rollout(), alb_config(), ingresses, load_balancers, verify).unwrap()
}

const ACTION_KEY: &str = "alb.ingress.kubernetes.io/actions.checkout-stable";

#[test]
fn test_forward_action_orders_canary_additional_stable() {
    let r = reconciler(FakeIngresses::with(ingress(None)), None, false);
    let extra = vec![WeightDestination {
        service_name: "checkout-preview".to_string(),
        weight: 10,
        pod_template_hash: None,
    }];

    let action = r.forward_action(20, &extra).unwrap();

    let groups: Vec<(String, Option<i64>)> = action
        .forward_config
        .target_groups
        .iter()
        .map(|tg| (tg.service_name.clone(), tg.weight))
        .collect();
    assert_eq!(
        groups,
        vec![
            ("checkout-canary".to_string(), Some(20)),
            ("checkout-preview".to_string(), Some(10)),
            ("checkout-stable".to_string(), Some(70)),
        ]
    );
    assert!(action.forward_config.target_groups.iter().all(|tg| tg.service_port == "80"));
}

#[test]
fn test_forward_action_json_shape() {
    let r = reconciler(FakeIngresses::with(ingress(None)), None, false);
    let raw = serde_json::to_string(&r.forward_action(30, &[]).unwrap()).unwrap();
    assert_eq!(
        raw,
        r#"{"Type":"forward","ForwardConfig":{"TargetGroups":[{"ServiceName":"checkout-canary","ServicePort":"80","Weight":30},{"ServiceName":"checkout-stable","ServicePort":"80","Weight":70}]}}"#
    );
}

#[tokio::test]
async fn test_set_weight_then_verify_round_trip() {
    let ingresses = FakeIngresses::with(ingress(Some("checkout.elb.amazonaws.com")));
    let lb: Arc<dyn LoadBalancerReader> = Arc::new(ReflectingLoadBalancer {
        ingresses: ingresses.clone(),
        action_key: ACTION_KEY.to_string(),
        known: true,
    });
    let r = reconciler(ingresses.clone(), Some(lb), true);

    assert!(!r.verify_weight(40, &[]).await.unwrap());

    r.set_weight(40, &[]).await.unwrap();
    assert!(r.verify_weight(40, &[]).await.unwrap());
    assert!(!r.verify_weight(50, &[]).await.unwrap());

    assert_eq!(
        ingresses.annotation(MANAGED_ACTIONS_ANNOTATION).as_deref(),
        Some("checkout:alb.ingress.kubernetes.io/actions.checkout-stable")
    );
}

#[tokio::test]
async fn test_set_weight_same_value_produces_no_patch() {
    let ingresses = FakeIngresses::with(ingress(None));
    let r = reconciler(ingresses.clone(), None, false);

    r.set_weight(25, &[]).await.unwrap();
    r.set_weight(25, &[]).await.unwrap();

    assert_eq!(ingresses.patches().len(), 1);

    r.set_weight(50, &[]).await.unwrap();
    let patches = ingresses.patches();
    assert_eq!(patches.len(), 2);
    // Only the changed action is sent, never the untouched annotations
    let changed = patches[1]["metadata"]["annotations"].as_object().unwrap();
    assert_eq!(changed.len(), 1);
    assert!(changed.contains_key(ACTION_KEY));
}

#[tokio::test]
async fn test_verify_without_load_balancer_is_not_ready() {
    let ingresses = FakeIngresses::with(ingress(None));
    let lb: Arc<dyn LoadBalancerReader> = Arc::new(ReflectingLoadBalancer {
        ingresses: ingresses.clone(),
        action_key: ACTION_KEY.to_string(),
        known: true,
    });
    let r = reconciler(ingresses, Some(lb), true);

    r.set_weight(10, &[]).await.unwrap();
    assert!(!r.verify_weight(10, &[]).await.unwrap());
}

#[tokio::test]
async fn test_verify_unknown_load_balancer_is_not_ready() {
    let ingresses = FakeIngresses::with(ingress(Some("gone.elb.amazonaws.com")));
    let lb: Arc<dyn LoadBalancerReader> = Arc::new(ReflectingLoadBalancer {
        ingresses: ingresses.clone(),
        action_key: ACTION_KEY.to_string(),
        known: false,
    });
    let r = reconciler(ingresses, Some(lb), true);

    r.set_weight(10, &[]).await.unwrap();
    assert!(!r.verify_weight(10, &[]).await.unwrap());
}

#[tokio::test]
async fn test_verify_disabled_always_verified() {
    let ingresses = FakeIngresses::with(ingress(None));
    let r = reconciler(ingresses, None, false);
    assert!(r.verify_weight(77, &[]).await.unwrap());
}

#[tokio::test]
async fn test_verify_falls_back_to_stored_action_without_reader() {
    let ingresses = FakeIngresses::with(ingress(Some("checkout.elb.amazonaws.com")));
    let r = reconciler(ingresses, None, true);

    r.set_weight(60, &[]).await.unwrap();
    assert!(r.verify_weight(60, &[]).await.unwrap());
    assert!(!r.verify_weight(70, &[]).await.unwrap());
}

#[tokio::test]
async fn test_set_weight_requires_ingress_rule_for_service() {
    let mut without_rule = ingress(None);
    without_rule.spec = None;
    let r = reconciler(FakeIngresses::with(without_rule), None, false);

    let err = r.set_weight(10, &[]).await.unwrap_err();
    assert!(err.to_string().contains("checkout-stable"));
}

#[tokio::test]
async fn test_set_weight_missing_ingress_is_not_found() {
    let ingresses = Arc::new(FakeIngresses::default());
    let r = reconciler(ingresses, None, false);
    assert!(matches!(
        r.set_weight(10, &[]).await,
        Err(TrafficRoutingError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_managed_routes_drops_action_and_marker() {
    let ingresses = FakeIngresses::with(ingress(None));
    let r = reconciler(ingresses.clone(), None, false);

    r.set_weight(30, &[]).await.unwrap();
    r.remove_managed_routes().await.unwrap();

    assert!(ingresses.annotation(ACTION_KEY).is_none());
    assert!(ingresses.annotation(MANAGED_ACTIONS_ANNOTATION).is_none());
    assert_eq!(
        ingresses.annotation("kubernetes.io/ingress.class").as_deref(),
        Some("alb")
    );
}

#[test]
fn test_managed_actions_parse_and_format() {
    let parsed = parse_managed_actions("a:alb.ingress.kubernetes.io/actions.x, b:alb.ingress.kubernetes.io/actions.y").unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed["b"], "alb.ingress.kubernetes.io/actions.y");
    assert_eq!(
        format_managed_actions(&parsed),
        "a:alb.ingress.kubernetes.io/actions.x,b:alb.ingress.kubernetes.io/actions.y"
    );
    assert!(parse_managed_actions("no-separator").is_err());
    assert!(parse_managed_actions("").unwrap().is_empty());
}
