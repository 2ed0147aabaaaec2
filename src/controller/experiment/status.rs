//! Pure status calculations for Experiments

use crate::controller::clock::{format_time, parse_time};
use crate::crd::duration::parse_duration;
use crate::crd::experiment::{
    Experiment, ExperimentAnalysisRunStatus, ExperimentCondition, ExperimentPhase,
    ExperimentStatus, TemplateStatus, TemplateStatusCode,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const REASON_REPLICASET_UPDATED: &str = "ReplicaSetUpdated";
pub const REASON_NEW_REPLICASET_AVAILABLE: &str = "NewReplicaSetAvailable";
pub const REASON_EXPERIMENT_COMPLETED: &str = "ExperimentCompleted";
pub const REASON_PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Configured run time, or `None` when the experiment runs until terminated
pub fn experiment_duration(experiment: &Experiment) -> Option<chrono::Duration> {
    let raw = experiment.spec.duration.as_deref()?;
    match parse_duration(raw) {
        Ok(d) => chrono::Duration::from_std(d).ok(),
        Err(e) => {
            warn!(duration = %raw, error = %e, "Invalid experiment duration, ignoring");
            None
        }
    }
}

/// Whether the experiment ran for its full duration after becoming available
pub fn passed_duration(
    experiment: &Experiment,
    status: &ExperimentStatus,
    now: DateTime<Utc>,
) -> bool {
    let Some(duration) = experiment_duration(experiment) else {
        return false;
    };
    match status.available_at.as_deref().and_then(parse_time) {
        Some(available_at) => now >= available_at + duration,
        None => false,
    }
}

/// Computed, never stored: the experiment must head for a terminal phase
pub fn is_terminating(experiment: &Experiment, status: &ExperimentStatus, now: DateTime<Utc>) -> bool {
    if experiment.spec.terminate {
        return true;
    }
    if status
        .analysis_runs
        .iter()
        .any(|run| run.phase.is_unsuccessful())
    {
        return true;
    }
    status.phase == Some(ExperimentPhase::Running) && passed_duration(experiment, status, now)
}

/// Inputs observed for one template in this reconcile
pub struct TemplateObservation<'a> {
    pub previous: Option<&'a TemplateStatus>,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub creation_error: Option<String>,
    pub terminating: bool,
    pub progress_deadline: chrono::Duration,
}

/// Next status code and message for a template
pub fn next_template_status(
    obs: &TemplateObservation<'_>,
    now: DateTime<Utc>,
) -> (TemplateStatusCode, Option<String>) {
    if let Some(err) = &obs.creation_error {
        return (
            TemplateStatusCode::Error,
            Some(format!("Failed to create ReplicaSet: {}", err)),
        );
    }

    if let Some(prev) = obs.previous {
        if prev.status.is_completed() {
            return (prev.status, prev.message.clone());
        }
    }

    if obs.terminating {
        return (TemplateStatusCode::Successful, None);
    }

    if obs.desired_replicas > 0 && obs.ready_replicas >= obs.desired_replicas {
        return (TemplateStatusCode::Running, None);
    }

    let started = obs
        .previous
        .filter(|p| p.status == TemplateStatusCode::Progressing)
        .and_then(|p| p.last_transition_time.as_deref())
        .and_then(parse_time);
    if let Some(started) = started {
        if now >= started + obs.progress_deadline {
            return (
                TemplateStatusCode::Failed,
                Some(format!(
                    "{}: template has not progressed for {}s",
                    REASON_PROGRESS_DEADLINE_EXCEEDED,
                    obs.progress_deadline.num_seconds()
                )),
            );
        }
    }

    (TemplateStatusCode::Progressing, None)
}

/// Carry `lastTransitionTime` forward unless the status code changed
pub fn transition_time(
    previous: Option<&TemplateStatus>,
    code: TemplateStatusCode,
    now: DateTime<Utc>,
) -> Option<String> {
    match previous {
        Some(prev) if prev.status == code && prev.last_transition_time.is_some() => {
            prev.last_transition_time.clone()
        }
        _ => Some(format_time(now)),
    }
}

/// `availableAt` is recorded once, when every template is first Running
pub fn available_at(
    previous: Option<&str>,
    templates: &[TemplateStatus],
    now: DateTime<Utc>,
) -> Option<String> {
    if previous.is_some() {
        return previous.map(str::to_string);
    }
    if !templates.is_empty()
        && templates
            .iter()
            .all(|t| t.status == TemplateStatusCode::Running)
    {
        return Some(format_time(now));
    }
    None
}

/// Aggregate phase and message
///
/// Terminal phases stick. Template errors outrank template failures, which
/// outrank analysis results; otherwise the worst template status decides.
pub fn calculate_phase(
    previous: &ExperimentStatus,
    templates: &[TemplateStatus],
    analysis_runs: &[ExperimentAnalysisRunStatus],
    available: bool,
) -> (ExperimentPhase, Option<String>) {
    if let Some(phase) = previous.phase.filter(|p| p.is_completed()) {
        return (phase, previous.message.clone());
    }

    for code in [TemplateStatusCode::Error, TemplateStatusCode::Failed] {
        if let Some(t) = templates.iter().find(|t| t.status == code) {
            let message = match &t.message {
                Some(m) => format!("Template {}: {}", t.name, m),
                None => format!("Template {} {:?}", t.name, code),
            };
            return (code.to_phase(), Some(message));
        }
    }

    for phase in [
        ExperimentPhase::Error,
        ExperimentPhase::Failed,
        ExperimentPhase::Inconclusive,
    ] {
        if let Some(run) = analysis_runs.iter().find(|r| r.phase == phase) {
            let message = run
                .message
                .clone()
                .unwrap_or_else(|| format!("Analysis {} {}", run.name, phase));
            return (phase, Some(message));
        }
    }

    let worst = templates.iter().map(|t| t.status).max_by_key(|c| c.severity());
    match worst {
        None => (ExperimentPhase::Pending, None),
        Some(TemplateStatusCode::Progressing) if available => (ExperimentPhase::Running, None),
        Some(code) => (code.to_phase(), None),
    }
}

/// The single `Progressing` condition, reusing timestamps when unchanged
pub fn progressing_condition(
    name: &str,
    phase: ExperimentPhase,
    previous: &[ExperimentCondition],
    now: DateTime<Utc>,
) -> ExperimentCondition {
    let (status, reason, message) = match phase {
        ExperimentPhase::Pending => (
            "True",
            REASON_REPLICASET_UPDATED,
            format!("Experiment {:?} is progressing", name),
        ),
        ExperimentPhase::Running => (
            "True",
            REASON_NEW_REPLICASET_AVAILABLE,
            format!("Experiment {:?} is running", name),
        ),
        _ => (
            "False",
            REASON_EXPERIMENT_COMPLETED,
            format!("Experiment {:?} has completed", name),
        ),
    };

    let prev = previous.iter().find(|c| c.type_ == CONDITION_PROGRESSING);
    let now = format_time(now);

    match prev {
        Some(p) if p.status == status && p.reason == reason && p.message == message => p.clone(),
        Some(p) if p.status == status => ExperimentCondition {
            type_: CONDITION_PROGRESSING.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            last_update_time: now,
            last_transition_time: p.last_transition_time.clone(),
        },
        _ => ExperimentCondition {
            type_: CONDITION_PROGRESSING.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            last_update_time: now.clone(),
            last_transition_time: now,
        },
    }
}

/// Tracks the earliest future instant the experiment must be looked at again
#[derive(Debug)]
pub struct NextWakeup {
    now: DateTime<Utc>,
    earliest: Option<DateTime<Utc>>,
}

impl NextWakeup {
    pub fn new(now: DateTime<Utc>) -> Self {
        NextWakeup {
            now,
            earliest: None,
        }
    }

    /// Record an instant; instants not after `now` are ignored
    pub fn at(&mut self, when: DateTime<Utc>) {
        if when <= self.now {
            return;
        }
        self.earliest = Some(match self.earliest {
            Some(current) if current <= when => current,
            _ => when,
        });
    }

    pub fn after(&mut self, delay: Duration) {
        if let Ok(delay) = chrono::Duration::from_std(delay) {
            self.at(self.now + delay);
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.earliest.and_then(|e| (e - self.now).to_std().ok())
    }
}

/// Deadlines driven by the status itself: the end of the run and the
/// progress deadline of templates still progressing
pub fn status_wakeups(
    experiment: &Experiment,
    status: &ExperimentStatus,
    wakeup: &mut NextWakeup,
) {
    if status.phase.map(|p| p.is_completed()).unwrap_or(false) {
        return;
    }

    if let (Some(duration), Some(available_at)) = (
        experiment_duration(experiment),
        status.available_at.as_deref().and_then(parse_time),
    ) {
        wakeup.at(available_at + duration);
    }

    let deadline = chrono::Duration::seconds(experiment.progress_deadline_seconds() as i64);
    for template in &status.template_statuses {
        if template.status != TemplateStatusCode::Progressing {
            continue;
        }
        if let Some(since) = template.last_transition_time.as_deref().and_then(parse_time) {
            wakeup.at(since + deadline);
        }
    }
}
