//! Schedule a restart of a rollout's pods

use crate::controller::clock::format_time;
use crate::crd::duration::{parse_duration, DurationError};
use crate::crd::rollout::Rollout;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::Api;
use serde_json::{json, Value};

/// Delay used when `--in` is not given
pub const DEFAULT_DELAY: &str = "0s";

/// Instant the restart should happen, `delay` after `now`
pub fn restart_at(now: DateTime<Utc>, delay: &str) -> Result<DateTime<Utc>, DurationError> {
    let delay = parse_duration(delay)?;
    // Durations beyond chrono's range clamp to the far future
    let offset = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Ok(now.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// Merge patch setting `spec.restartAt`
pub fn restart_patch(at: DateTime<Utc>) -> Value {
    json!({ "spec": { "restartAt": format_time(at) } })
}

pub fn restart_message(rollout: &str, delay: &str) -> String {
    format!("rollout '{}' restarts in {}", rollout, delay)
}

/// Patch the rollout and return the confirmation line to print
pub async fn restart_rollout(
    api: &Api<Rollout>,
    name: &str,
    delay: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let at = restart_at(now, delay)?;
    api.patch(name, &PatchParams::default(), &Patch::Merge(restart_patch(at)))
        .await?;
    tracing::debug!(rollout = %name, restart_at = %format_time(at), "Scheduled restart");
    Ok(restart_message(name, delay))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_default_delay_restarts_now() {
        assert_eq!(restart_at(now(), DEFAULT_DELAY).unwrap(), now());
    }

    #[test]
    fn test_delay_is_added() {
        let at = restart_at(now(), "90s").unwrap();
        assert_eq!(
            restart_patch(at),
            json!({"spec": {"restartAt": "2026-03-01T12:01:30Z"}})
        );
    }

    #[test]
    fn test_invalid_delay_rejected() {
        assert!(restart_at(now(), "soon").is_err());
    }

    #[test]
    fn test_message() {
        assert_eq!(restart_message("shop", "30s"), "rollout 'shop' restarts in 30s");
    }
}
