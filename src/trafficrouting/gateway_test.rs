#![allow(clippy::unwrap_used)]

use super::*;
use std::sync::Mutex;

#[derive(Default)]
struct FakeRoutes {
    route: Mutex<Option<DynamicObject>>,
    patches: Mutex<Vec<Value>>,
}

impl FakeRoutes {
    fn with(route: DynamicObject) -> Arc<Self> {
        Arc::new(FakeRoutes {
            route: Mutex::new(Some(route)),
            patches: Mutex::default(),
        })
    }

    fn rules(&self) -> Vec<Value> {
        route_rules(self.route.lock().unwrap().as_ref().unwrap())
    }

    fn accept(&self) {
        let mut guard = self.route.lock().unwrap();
        guard.as_mut().unwrap().data["status"] = json!({
            "parents": [{
                "parentRef": { "name": "public" },
                "conditions": [{ "type": "Accepted", "status": "True" }]
            }]
        });
    }
}

#[async_trait]
impl HttpRouteClient for FakeRoutes {
    async fn get_http_route(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<DynamicObject>, TrafficRoutingError> {
        Ok(self.route.lock().unwrap().clone())
    }

    async fn patch_http_route(
        &self,
        _namespace: &str,
        _name: &str,
        patch: &Value,
    ) -> Result<(), TrafficRoutingError> {
        self.patches.lock().unwrap().push(patch.clone());
        let mut guard = self.route.lock().unwrap();
        guard.as_mut().unwrap().data["spec"]["rules"] = patch["spec"]["rules"].clone();
        Ok(())
    }
}

fn rollout() -> Rollout {
    serde_yaml::from_str(
        r#"
apiVersion: rollgate.io/v1alpha1
kind: Rollout
metadata:
  name: checkout
  namespace: shop
spec:
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
        gatewayAPI:
          httpRoute: checkout-route
"#,
    )
    .unwrap()
}

fn http_route() -> DynamicObject {
    let mut route = DynamicObject::new("checkout-route", &http_route_resource()).within("shop");
    route.metadata.resource_version = Some("42".to_string());
    route.data = json!({
        "spec": {
            "parentRefs": [{ "name": "public" }],
            "rules": [
                {
                    "matches": [{ "path": { "type": "PathPrefix", "value": "/checkout" } }],
                    "backendRefs": [{ "name": "checkout-stable", "port": 8080 }]
                },
                {
                    "backendRefs": [{ "name": "fallback", "port": 80 }]
                }
            ]
        }
    });
    route
}

fn reconciler(routes: Arc<FakeRoutes>, verify: bool) -> GatewayApiReconciler {
    let r = rollout();
    let config = r.traffic_routing().unwrap().gateway_api.clone().unwrap();
    GatewayApiReconciler::new(&r, config, routes, verify).unwrap()
}

#[tokio::test]
async fn test_set_weight_rewrites_first_rule_only() {
    let routes = FakeRoutes::with(http_route());
    let r = reconciler(routes.clone(), false);

    r.set_weight(30, &[]).await.unwrap();

    let rules = routes.rules();
    assert_eq!(
        backend_weights(&rules[0]),
        vec![
            ("checkout-canary".to_string(), 30),
            ("checkout-stable".to_string(), 70)
        ]
    );
    // Matches and the second rule are preserved
    assert_eq!(rules[0]["matches"][0]["path"]["value"], "/checkout");
    assert_eq!(backend_weights(&rules[1]), vec![("fallback".to_string(), 1)]);
    // Port is inherited from the existing backend
    assert_eq!(rules[0]["backendRefs"][0]["port"], 8080);
}

#[tokio::test]
async fn test_set_weight_patch_carries_resource_version() {
    let routes = FakeRoutes::with(http_route());
    reconciler(routes.clone(), false).set_weight(10, &[]).await.unwrap();

    let patches = routes.patches.lock().unwrap().clone();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0]["metadata"]["resourceVersion"], "42");
}

#[tokio::test]
async fn test_set_weight_is_idempotent() {
    let routes = FakeRoutes::with(http_route());
    let r = reconciler(routes.clone(), false);

    r.set_weight(50, &[]).await.unwrap();
    r.set_weight(50, &[]).await.unwrap();

    assert_eq!(routes.patches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_additional_destinations_between_canary_and_stable() {
    let routes = FakeRoutes::with(http_route());
    let r = reconciler(routes.clone(), false);
    let extra = vec![WeightDestination {
        service_name: "checkout-exp".to_string(),
        weight: 5,
        pod_template_hash: Some("abc".to_string()),
    }];

    r.set_weight(20, &extra).await.unwrap();

    assert_eq!(
        backend_weights(&routes.rules()[0]),
        vec![
            ("checkout-canary".to_string(), 20),
            ("checkout-exp".to_string(), 5),
            ("checkout-stable".to_string(), 75)
        ]
    );
}

#[tokio::test]
async fn test_verify_requires_accepted_route() {
    let routes = FakeRoutes::with(http_route());
    let r = reconciler(routes.clone(), true);

    r.set_weight(40, &[]).await.unwrap();
    assert!(!r.verify_weight(40, &[]).await.unwrap());

    routes.accept();
    assert!(r.verify_weight(40, &[]).await.unwrap());
    assert!(!r.verify_weight(60, &[]).await.unwrap());
}

#[tokio::test]
async fn test_missing_route_is_not_found() {
    let r = reconciler(Arc::new(FakeRoutes::default()), false);
    assert!(matches!(
        r.set_weight(10, &[]).await,
        Err(TrafficRoutingError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_weight_out_of_range_rejected() {
    let routes = FakeRoutes::with(http_route());
    let r = reconciler(routes.clone(), false);
    assert!(matches!(
        r.set_weight(120, &[]).await,
        Err(TrafficRoutingError::InvalidWeight { weight: 120 })
    ));
    assert!(routes.patches.lock().unwrap().is_empty());
}
