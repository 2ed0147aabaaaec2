//! In-memory `ExperimentClient` for tests

#![allow(clippy::unwrap_used)]

use super::client::{ClientError, ExperimentClient};
use super::replicaset::EXPERIMENT_LABEL;
use crate::crd::experiment::ExperimentStatus;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum FakeAction {
    CreateReplicaSet(String),
    ScaleReplicaSet(String, i32),
    AnnotateReplicaSet(String, String, Option<String>),
    CreateService(String),
    DeleteService(String),
    PatchStatus(String),
}

#[derive(Default)]
pub struct FakeExperimentClient {
    replica_sets: Mutex<BTreeMap<String, ReplicaSet>>,
    services: Mutex<BTreeMap<String, Service>>,
    actions: Mutex<Vec<FakeAction>>,
    patched: Mutex<Vec<ExperimentStatus>>,
    reject_replica_set_create: AtomicBool,
}

fn labelled_for<K: Resource>(obj: &K, experiment: &str) -> bool {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(EXPERIMENT_LABEL))
        .map(|v| v == experiment)
        .unwrap_or(false)
}

impl FakeExperimentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replica_set(self, rs: ReplicaSet) -> Self {
        self.replica_sets
            .lock()
            .unwrap()
            .insert(rs.name_any(), rs);
        self
    }

    pub fn with_service(self, svc: Service) -> Self {
        self.services.lock().unwrap().insert(svc.name_any(), svc);
        self
    }

    pub fn reject_replica_set_create(&self) {
        self.reject_replica_set_create.store(true, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<FakeAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn patched_statuses(&self) -> Vec<ExperimentStatus> {
        self.patched.lock().unwrap().clone()
    }

    pub fn replica_set(&self, name: &str) -> Option<ReplicaSet> {
        self.replica_sets.lock().unwrap().get(name).cloned()
    }

    fn record(&self, action: FakeAction) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl ExperimentClient for FakeExperimentClient {
    async fn list_replica_sets(
        &self,
        _namespace: &str,
        experiment: &str,
    ) -> Result<Vec<ReplicaSet>, ClientError> {
        Ok(self
            .replica_sets
            .lock()
            .unwrap()
            .values()
            .filter(|rs| labelled_for(*rs, experiment))
            .cloned()
            .collect())
    }

    async fn get_replica_set(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClientError> {
        Ok(self.replica_set(name))
    }

    async fn create_replica_set(
        &self,
        _namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError> {
        let name = rs.name_any();
        if self.reject_replica_set_create.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected {
                object: format!("replicaset/{}", name),
                message: "quota exceeded".to_string(),
            });
        }
        let mut store = self.replica_sets.lock().unwrap();
        if store.contains_key(&name) {
            return Err(ClientError::AlreadyExists(format!("replicaset/{}", name)));
        }
        store.insert(name.clone(), rs.clone());
        drop(store);
        self.record(FakeAction::CreateReplicaSet(name));
        Ok(rs.clone())
    }

    async fn scale_replica_set(
        &self,
        _namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClientError> {
        {
            let mut store = self.replica_sets.lock().unwrap();
            let rs = store
                .get_mut(name)
                .ok_or_else(|| ClientError::NotFound(format!("replicaset/{}", name)))?;
            if let Some(spec) = rs.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
        }
        self.record(FakeAction::ScaleReplicaSet(name.to_string(), replicas));
        Ok(())
    }

    async fn annotate_replica_set(
        &self,
        _namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), ClientError> {
        {
            let mut store = self.replica_sets.lock().unwrap();
            let rs = store
                .get_mut(name)
                .ok_or_else(|| ClientError::NotFound(format!("replicaset/{}", name)))?;
            let annotations = rs.metadata.annotations.get_or_insert_with(Default::default);
            match &value {
                Some(v) => {
                    annotations.insert(key.to_string(), v.clone());
                }
                None => {
                    annotations.remove(key);
                }
            }
        }
        self.record(FakeAction::AnnotateReplicaSet(
            name.to_string(),
            key.to_string(),
            value,
        ));
        Ok(())
    }

    async fn list_services(
        &self,
        _namespace: &str,
        experiment: &str,
    ) -> Result<Vec<Service>, ClientError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|svc| labelled_for(*svc, experiment))
            .cloned()
            .collect())
    }

    async fn create_service(&self, _namespace: &str, svc: &Service) -> Result<Service, ClientError> {
        let name = svc.name_any();
        {
            let mut store = self.services.lock().unwrap();
            if store.contains_key(&name) {
                return Err(ClientError::AlreadyExists(format!("service/{}", name)));
            }
            store.insert(name.clone(), svc.clone());
        }
        self.record(FakeAction::CreateService(name));
        Ok(svc.clone())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), ClientError> {
        self.services.lock().unwrap().remove(name);
        self.record(FakeAction::DeleteService(name.to_string()));
        Ok(())
    }

    async fn patch_experiment_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), ClientError> {
        self.patched.lock().unwrap().push(status.clone());
        self.record(FakeAction::PatchStatus(name.to_string()));
        Ok(())
    }
}
