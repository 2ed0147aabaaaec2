//! One level-triggered pass over an Experiment
//!
//! `ExperimentContext::reconcile` converges owned ReplicaSets and Services
//! toward the experiment spec and computes the next status from scratch. It
//! never writes the experiment's own status; the caller diffs and patches.

use crate::controller::clock::format_time;
use crate::controller::experiment::client::{ClientError, ExperimentClient};
use crate::controller::experiment::replicaset::{
    build_replica_set, compute_pod_template_hash, has_scale_down_annotation, is_owned_by,
    replica_set_name, scale_down_deadline, spec_replicas, template_of,
    SCALE_DOWN_DEADLINE_ANNOTATION,
};
use crate::controller::experiment::service::build_service;
use crate::controller::experiment::status::{
    self, next_template_status, transition_time, NextWakeup, TemplateObservation,
};
use crate::controller::ReconcileError;
use crate::crd::experiment::{Experiment, ExperimentStatus, TemplateSpec, TemplateStatus};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requeue used after bumping a collision count so the new name is tried soon
const COLLISION_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub status: ExperimentStatus,
    /// Earliest future instant that needs another look; `None` leaves it to
    /// the periodic resync
    pub requeue_after: Option<Duration>,
}

/// Where a ReplicaSet stands with respect to scale-down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleDown {
    /// Desired replicas are positive
    NotRequested,
    /// Waiting for the deadline annotation to pass
    Waiting,
    /// Scaled to zero (now or earlier)
    Done,
}

pub struct ExperimentContext<'a> {
    experiment: &'a Experiment,
    client: &'a dyn ExperimentClient,
    namespace: String,
    name: String,
    uid: Option<String>,
    now: DateTime<Utc>,
}

/// Owned children of a single template
struct TemplateChildren {
    replica_sets: Vec<ReplicaSet>,
    services: Vec<Service>,
}

impl<'a> ExperimentContext<'a> {
    pub fn new(
        experiment: &'a Experiment,
        client: &'a dyn ExperimentClient,
        now: DateTime<Utc>,
    ) -> Result<Self, ReconcileError> {
        let namespace = experiment
            .namespace()
            .ok_or(ReconcileError::MissingNamespace { kind: "Experiment" })?;
        Ok(ExperimentContext {
            experiment,
            client,
            namespace,
            name: experiment.name_any(),
            uid: experiment.uid(),
            now,
        })
    }

    /// Only objects controlled by this experiment count, when ownership is known
    fn owned<K: kube::Resource>(&self, obj: &K) -> bool {
        match &self.uid {
            Some(uid) => is_owned_by(obj, uid),
            None => true,
        }
    }

    fn children_of(
        &self,
        template: &str,
        replica_sets: &[ReplicaSet],
        services: &[Service],
    ) -> TemplateChildren {
        TemplateChildren {
            replica_sets: replica_sets
                .iter()
                .filter(|rs| template_of(*rs) == Some(template) && self.owned(*rs))
                .cloned()
                .collect(),
            services: services
                .iter()
                .filter(|svc| template_of(*svc) == Some(template) && self.owned(*svc))
                .cloned()
                .collect(),
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let previous = self.experiment.status.clone().unwrap_or_default();
        let finished = self.experiment.has_finished();
        let terminating = status::is_terminating(self.experiment, &previous, self.now);
        if terminating && !finished {
            info!(experiment = ?self.name, "Experiment is terminating");
        }

        let replica_sets = self
            .client
            .list_replica_sets(&self.namespace, &self.name)
            .await?;
        let services = self.client.list_services(&self.namespace, &self.name).await?;

        let mut wakeup = NextWakeup::new(self.now);
        let mut template_statuses = Vec::with_capacity(self.experiment.spec.templates.len());

        for template in &self.experiment.spec.templates {
            let children = self.children_of(&template.name, &replica_sets, &services);
            let prev = previous.template_status(&template.name);
            let ts = self
                .reconcile_template(template, prev, children, finished, terminating, &mut wakeup)
                .await?;
            template_statuses.push(ts);
        }

        let available_at =
            status::available_at(previous.available_at.as_deref(), &template_statuses, self.now);
        let (phase, message) = status::calculate_phase(
            &previous,
            &template_statuses,
            &previous.analysis_runs,
            available_at.is_some(),
        );
        let condition =
            status::progressing_condition(&self.name, phase, &previous.conditions, self.now);

        let mut conditions: Vec<_> = previous
            .conditions
            .iter()
            .filter(|c| c.type_ != condition.type_)
            .cloned()
            .collect();
        conditions.push(condition);

        let new_status = ExperimentStatus {
            phase: Some(phase),
            message,
            available_at,
            template_statuses,
            analysis_runs: previous.analysis_runs.clone(),
            conditions,
        };

        status::status_wakeups(self.experiment, &new_status, &mut wakeup);

        Ok(ReconcileOutcome {
            status: new_status,
            requeue_after: wakeup.delay(),
        })
    }

    async fn reconcile_template(
        &self,
        template: &TemplateSpec,
        prev: Option<&TemplateStatus>,
        children: TemplateChildren,
        finished: bool,
        terminating: bool,
        wakeup: &mut NextWakeup,
    ) -> Result<TemplateStatus, ReconcileError> {
        let prev_done = prev.map(|p| p.status.is_completed()).unwrap_or(false);
        let desired = if finished || terminating || prev_done {
            0
        } else {
            template.replicas_or_default()
        };

        let mut collision_count = prev.and_then(|p| p.collision_count);
        let hash = compute_pod_template_hash(
            &template.template,
            collision_count,
            template.collision_salt.as_deref(),
        )?;
        let rs_name = replica_set_name(&self.name, &template.name, &hash);

        let mut creation_error = None;
        let mut collided = false;
        let mut current = children
            .replica_sets
            .iter()
            .find(|rs| rs.name_any() == rs_name)
            .cloned();

        if current.is_none() {
            let rs = build_replica_set(self.experiment, template, &hash, desired);
            info!(
                experiment = ?self.name,
                template = %template.name,
                replicaset = %rs_name,
                replicas = desired,
                "Creating ReplicaSet"
            );
            match self.client.create_replica_set(&self.namespace, &rs).await {
                Ok(created) => current = Some(created),
                Err(ClientError::AlreadyExists(_)) => {
                    match self.client.get_replica_set(&self.namespace, &rs_name).await? {
                        Some(existing)
                            if template_of(&existing) == Some(template.name.as_str())
                                && self.owned(&existing) =>
                        {
                            current = Some(existing);
                        }
                        _ => {
                            let next = collision_count.unwrap_or(0) + 1;
                            warn!(
                                experiment = ?self.name,
                                replicaset = %rs_name,
                                collision_count = next,
                                "ReplicaSet name collides with a foreign object"
                            );
                            collision_count = Some(next);
                            collided = true;
                            wakeup.after(COLLISION_RETRY);
                        }
                    }
                }
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    warn!(
                        experiment = ?self.name,
                        replicaset = %rs_name,
                        error = %e,
                        "Failed to create ReplicaSet"
                    );
                    creation_error = Some(e.to_string());
                }
            }
        }

        // Older revisions of this template are no longer wanted
        for stale in children.replica_sets.iter().filter(|rs| rs.name_any() != rs_name) {
            if spec_replicas(stale) != 0 {
                info!(replicaset = %stale.name_any(), "Scaling down outdated ReplicaSet");
                self.client
                    .scale_replica_set(&self.namespace, &stale.name_any(), 0)
                    .await?;
            }
        }

        let scale_down = match &current {
            Some(rs) if !collided => self.reconcile_replicas(rs, desired, wakeup).await?,
            _ => ScaleDown::Done,
        };

        let service_name = self
            .reconcile_service(template, current.as_ref(), &children.services, desired, scale_down)
            .await?;

        let rs_status = current.as_ref().and_then(|rs| rs.status.as_ref());
        let ready_replicas = rs_status.and_then(|s| s.ready_replicas).unwrap_or(0);

        let obs = TemplateObservation {
            previous: prev,
            desired_replicas: desired,
            ready_replicas,
            creation_error,
            terminating: terminating || finished,
            progress_deadline: chrono::Duration::seconds(
                self.experiment.progress_deadline_seconds() as i64,
            ),
        };
        let (code, mut message) = next_template_status(&obs, self.now);
        if collided {
            message = Some(format!(
                "ReplicaSet {} collides with an object not owned by this experiment",
                rs_name
            ));
        }

        Ok(TemplateStatus {
            name: template.name.clone(),
            replicas: rs_status.map(|s| s.replicas).unwrap_or(0),
            updated_replicas: rs_status
                .and_then(|s| s.fully_labeled_replicas)
                .unwrap_or(0),
            ready_replicas,
            available_replicas: rs_status.and_then(|s| s.available_replicas).unwrap_or(0),
            status: code,
            message,
            service_name,
            last_transition_time: transition_time(prev, code, self.now),
            collision_count,
        })
    }

    /// Move the ReplicaSet toward `desired`, deferring scale-down to zero
    /// behind the deadline annotation
    async fn reconcile_replicas(
        &self,
        rs: &ReplicaSet,
        desired: i32,
        wakeup: &mut NextWakeup,
    ) -> Result<ScaleDown, ReconcileError> {
        let name = rs.name_any();
        let current = spec_replicas(rs);

        if desired > 0 {
            if current != desired {
                info!(replicaset = %name, from = current, to = desired, "Scaling ReplicaSet");
                self.client
                    .scale_replica_set(&self.namespace, &name, desired)
                    .await?;
            }
            if has_scale_down_annotation(rs) {
                self.client
                    .annotate_replica_set(&self.namespace, &name, SCALE_DOWN_DEADLINE_ANNOTATION, None)
                    .await?;
            }
            return Ok(ScaleDown::NotRequested);
        }

        if current == 0 {
            return Ok(ScaleDown::Done);
        }

        let delay = self.experiment.scale_down_delay_seconds();
        if delay <= 0 {
            info!(replicaset = %name, "Scaling ReplicaSet to zero");
            self.client.scale_replica_set(&self.namespace, &name, 0).await?;
            return Ok(ScaleDown::Done);
        }

        match scale_down_deadline(rs) {
            None => {
                let deadline = self.now + chrono::Duration::seconds(delay as i64);
                debug!(
                    replicaset = %name,
                    deadline = %format_time(deadline),
                    "Marking ReplicaSet for delayed scale-down"
                );
                self.client
                    .annotate_replica_set(
                        &self.namespace,
                        &name,
                        SCALE_DOWN_DEADLINE_ANNOTATION,
                        Some(format_time(deadline)),
                    )
                    .await?;
                wakeup.at(deadline);
                Ok(ScaleDown::Waiting)
            }
            Some(deadline) if self.now >= deadline => {
                info!(replicaset = %name, "Scale-down deadline passed, scaling to zero");
                self.client.scale_replica_set(&self.namespace, &name, 0).await?;
                Ok(ScaleDown::Done)
            }
            Some(deadline) => {
                wakeup.at(deadline);
                Ok(ScaleDown::Waiting)
            }
        }
    }

    /// Delete every live Service except `keep`, reporting whether `keep` was live
    async fn prune_services(&self, live: &[Service], keep: Option<&str>) -> Result<bool, ReconcileError> {
        let mut kept = false;
        for svc in live {
            let name = svc.name_any();
            if keep == Some(name.as_str()) {
                kept = true;
                continue;
            }
            info!(service = %name, "Deleting outdated Service");
            self.client.delete_service(&self.namespace, &name).await?;
        }
        Ok(kept)
    }

    /// Converge the template's Service; returns the name to record in status
    async fn reconcile_service(
        &self,
        template: &TemplateSpec,
        rs: Option<&ReplicaSet>,
        live: &[Service],
        desired: i32,
        scale_down: ScaleDown,
    ) -> Result<Option<String>, ReconcileError> {
        if template.service.is_none() {
            for svc in live {
                info!(service = %svc.name_any(), "Deleting Service no longer requested");
                self.client
                    .delete_service(&self.namespace, &svc.name_any())
                    .await?;
            }
            return Ok(None);
        }

        let Some(rs) = rs.filter(|_| desired > 0) else {
            // Scaling down: keep the ReplicaSet's own Service until the ReplicaSet is gone
            let keep = rs
                .filter(|_| scale_down == ScaleDown::Waiting)
                .map(|rs| rs.name_any());
            let kept = self.prune_services(live, keep.as_deref()).await?;
            return Ok(keep.filter(|_| kept));
        };

        let wanted = rs.name_any();
        if !self.prune_services(live, Some(&wanted)).await? {
            info!(service = %wanted, template = %template.name, "Creating Service");
            let svc = build_service(self.experiment, &template.name, rs);
            match self.client.create_service(&self.namespace, &svc).await {
                Ok(_) | Err(ClientError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(wanted))
    }
}
