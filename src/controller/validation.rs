use crate::crd::duration::parse_duration;
use crate::crd::rollout::Rollout;

/// Validate the parts of a Rollout the controller relies on
///
/// Returns a human-readable message for the first problem found.
pub fn validate_rollout(rollout: &Rollout) -> Result<(), String> {
    let canary = rollout
        .spec
        .strategy
        .canary
        .as_ref()
        .ok_or_else(|| "spec.strategy.canary is required".to_string())?;

    if canary.canary_service.is_empty() {
        return Err("canaryService must not be empty".to_string());
    }
    if canary.stable_service.is_empty() {
        return Err("stableService must not be empty".to_string());
    }
    if canary.canary_service == canary.stable_service {
        return Err(format!(
            "canaryService and stableService must differ (both {:?})",
            canary.stable_service
        ));
    }

    for (index, step) in canary.steps.iter().enumerate() {
        if let Some(weight) = step.set_weight {
            if !(0..=100).contains(&weight) {
                return Err(format!(
                    "steps[{}].setWeight must be between 0 and 100, got {}",
                    index, weight
                ));
            }
        }
        if let Some(duration) = step.pause.as_ref().and_then(|p| p.duration.as_deref()) {
            parse_duration(duration)
                .map_err(|e| format!("steps[{}].pause.duration: {}", index, e))?;
        }
    }

    if let Some(alb) = canary.traffic_routing.as_ref().and_then(|t| t.alb.as_ref()) {
        if alb.ingress.is_empty() {
            return Err("trafficRouting.alb.ingress must not be empty".to_string());
        }
        if alb.service_port <= 0 {
            return Err(format!(
                "trafficRouting.alb.servicePort must be positive, got {}",
                alb.service_port
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn rollout_yaml(canary_block: &str) -> Rollout {
        let yaml = format!(
            r#"
apiVersion: rollgate.io/v1alpha1
kind: Rollout
metadata:
  name: demo
spec:
  selector:
    matchLabels:
      app: demo
  template:
    metadata:
      labels:
        app: demo
  strategy:
{}
"#,
            canary_block
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_valid_rollout() {
        let rollout = rollout_yaml(
            r#"    canary:
      canaryService: demo-canary
      stableService: demo-stable
      steps:
      - setWeight: 20
      - pause:
          duration: 1m
      trafficRouting:
        alb:
          ingress: demo
          servicePort: 80"#,
        );
        assert_eq!(validate_rollout(&rollout), Ok(()));
    }

    #[test]
    fn test_missing_canary_strategy() {
        let rollout = rollout_yaml("    {}");
        assert!(validate_rollout(&rollout).unwrap_err().contains("canary"));
    }

    #[test]
    fn test_same_service_rejected() {
        let rollout = rollout_yaml(
            r#"    canary:
      canaryService: demo
      stableService: demo"#,
        );
        assert!(validate_rollout(&rollout).unwrap_err().contains("must differ"));
    }

    #[test]
    fn test_weight_out_of_range() {
        let rollout = rollout_yaml(
            r#"    canary:
      canaryService: demo-canary
      stableService: demo-stable
      steps:
      - setWeight: 120"#,
        );
        assert!(validate_rollout(&rollout)
            .unwrap_err()
            .starts_with("steps[0].setWeight"));
    }

    #[test]
    fn test_bad_pause_duration() {
        let rollout = rollout_yaml(
            r#"    canary:
      canaryService: demo-canary
      stableService: demo-stable
      steps:
      - setWeight: 10
      - pause:
          duration: 5x"#,
        );
        assert!(validate_rollout(&rollout)
            .unwrap_err()
            .starts_with("steps[1].pause.duration"));
    }
}
