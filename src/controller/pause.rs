//! Pause step timing
//!
//! Pure functions deciding when a pause step is complete, when to wake up
//! during a timed pause, and what pause fields to persist. "Now" is always
//! passed in.

use crate::controller::clock::{format_time, parse_time};
use crate::crd::duration::parse_duration;
use crate::crd::rollout::{Rollout, RolloutPause};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Pause fields to persist after a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseStatus {
    /// Becomes `status.pauseStartTime`
    pub pause_start_time: Option<String>,
    /// Becomes `spec.paused`
    pub paused: bool,
}

fn pause_start(rollout: &Rollout) -> Option<DateTime<Utc>> {
    rollout
        .status
        .as_ref()
        .and_then(|s| s.pause_start_time.as_deref())
        .and_then(parse_time)
}

/// Duration of a timed pause; `None` for an indefinite pause
///
/// An unparsable duration is treated as indefinite so the rollout waits for
/// an explicit resume instead of skipping the pause.
pub fn pause_duration(pause: &RolloutPause) -> Option<Duration> {
    let raw = pause.duration.as_deref()?;
    match parse_duration(raw) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(duration = %raw, error = %e, "Invalid pause duration, waiting for manual resume");
            None
        }
    }
}

/// Whether the pause step has completed
///
/// A recorded pause that has been resumed (`spec.paused == false`) is always
/// complete, even while its timer is still running. Otherwise a timed pause
/// completes once `now >= start + duration`; an indefinite pause never
/// completes on its own.
pub fn completed_pause_step(rollout: &Rollout, pause: &RolloutPause, now: DateTime<Utc>) -> bool {
    let Some(start) = pause_start(rollout) else {
        return false;
    };

    if !rollout.spec.paused {
        return true;
    }

    match pause_duration(pause) {
        Some(duration) => match chrono::Duration::from_std(duration) {
            Ok(d) => now >= start + d,
            Err(_) => false,
        },
        None => false,
    }
}

/// Delay until a timed pause expires, when that falls inside the resync window
///
/// Returns `None` for indefinite pauses, pauses not yet started, and pauses
/// that already expired or expire after the next resync.
pub fn check_enqueue_rollout_during_pause(
    rollout: &Rollout,
    pause: &RolloutPause,
    resync: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let start = pause_start(rollout)?;
    let duration = chrono::Duration::from_std(pause_duration(pause)?).ok()?;
    let resync = chrono::Duration::from_std(resync).ok()?;

    let expiry = start + duration;
    if expiry > now && expiry < now + resync {
        (expiry - now).to_std().ok()
    } else {
        None
    }
}

/// Pause fields to write back
///
/// An unpaused rollout drops its start time. `add_pause` records a start time
/// only when none exists, so repeated calls keep the original instant.
pub fn calculate_pause_status(rollout: &Rollout, add_pause: bool, now: DateTime<Utc>) -> PauseStatus {
    let mut paused = rollout.spec.paused;
    let mut pause_start_time = rollout
        .status
        .as_ref()
        .and_then(|s| s.pause_start_time.clone());

    if !paused {
        pause_start_time = None;
    }

    if add_pause && pause_start_time.is_none() {
        pause_start_time = Some(format_time(now));
        paused = true;
    }

    PauseStatus {
        pause_start_time,
        paused,
    }
}

#[cfg(test)]
#[path = "pause_test.rs"]
mod tests;
