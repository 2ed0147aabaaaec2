//! Cluster API seam used by the Experiment reconciler
//!
//! The reconciler only talks to the cluster through `ExperimentClient`, so
//! tests swap in an in-memory fake.

use crate::controller::experiment::replicaset::EXPERIMENT_LABEL;
use crate::crd::experiment::{Experiment, ExperimentStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts for a read-modify-write that keeps hitting version conflicts
const CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict writing {0}")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{object} rejected: {message}")]
    Rejected { object: String, message: String },

    #[error("cluster API call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Kubernetes API error: {0}")]
    Api(kube::Error),
}

impl ClientError {
    /// Classify a kube error, tagging it with the object it concerns
    pub fn from_kube(err: kube::Error, object: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound(object.to_string()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClientError::AlreadyExists(object.to_string())
            }
            kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict(object.to_string()),
            kube::Error::Api(resp) if matches!(resp.code, 400 | 403 | 422) => ClientError::Rejected {
                object: object.to_string(),
                message: resp.message.clone(),
            },
            _ => ClientError::Api(err),
        }
    }

    /// Errors cleared by re-reading and retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Conflict(_) | ClientError::Timeout(_) | ClientError::NotFound(_)
        )
    }
}

#[async_trait]
pub trait ExperimentClient: Send + Sync {
    /// ReplicaSets labelled for the experiment
    async fn list_replica_sets(
        &self,
        namespace: &str,
        experiment: &str,
    ) -> Result<Vec<ReplicaSet>, ClientError>;

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClientError>;

    async fn create_replica_set(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError>;

    async fn scale_replica_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClientError>;

    /// Set (`Some`) or remove (`None`) one annotation on a ReplicaSet
    async fn annotate_replica_set(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), ClientError>;

    /// Services labelled for the experiment
    async fn list_services(
        &self,
        namespace: &str,
        experiment: &str,
    ) -> Result<Vec<Service>, ClientError>;

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service, ClientError>;

    /// Delete a Service; a missing Service is not an error
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), ClientError>;
}

/// `ExperimentClient` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeExperimentClient {
    client: kube::Client,
    timeout: Duration,
}

impl KubeExperimentClient {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        KubeExperimentClient { client, timeout }
    }

    async fn bounded<T, F>(&self, object: &str, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| ClientError::from_kube(e, object)),
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// Read-modify-replace a ReplicaSet, re-reading on version conflicts
    async fn update_replica_set<F>(
        &self,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(&mut ReplicaSet) + Send + Sync,
    {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let object = format!("replicaset/{}", name);
        let (api, object) = (&api, object.as_str());

        retry_on_conflict(
            object,
            move || self.bounded(object, api.get(name)),
            mutate,
            move |rs: ReplicaSet| async move {
                self.bounded(object, api.replace(name, &PostParams::default(), &rs))
                    .await
                    .map(|_| ())
            },
        )
        .await
    }
}

/// Run `get`, `mutate` and `replace` until the replace lands
///
/// A version conflict re-reads the object and tries again, up to
/// `CONFLICT_RETRIES` attempts in total. Any other error is returned as-is.
async fn retry_on_conflict<T, G, GF, M, R, RF>(
    object: &str,
    mut get: G,
    mutate: M,
    mut replace: R,
) -> Result<(), ClientError>
where
    G: FnMut() -> GF,
    GF: Future<Output = Result<T, ClientError>>,
    M: Fn(&mut T),
    R: FnMut(T) -> RF,
    RF: Future<Output = Result<(), ClientError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut current = get().await?;
        mutate(&mut current);
        match replace(current).await {
            Ok(()) => return Ok(()),
            Err(ClientError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                debug!(object, attempt, "Conflict on write, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

fn experiment_selector(experiment: &str) -> ListParams {
    ListParams::default().labels(&format!("{}={}", EXPERIMENT_LABEL, experiment))
}

#[async_trait]
impl ExperimentClient for KubeExperimentClient {
    async fn list_replica_sets(
        &self,
        namespace: &str,
        experiment: &str,
    ) -> Result<Vec<ReplicaSet>, ClientError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded("replicasets", api.list(&experiment_selector(experiment)))
            .await?;
        Ok(list.items)
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, ClientError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(&format!("replicaset/{}", name), api.get_opt(name))
            .await
    }

    async fn create_replica_set(
        &self,
        namespace: &str,
        rs: &ReplicaSet,
    ) -> Result<ReplicaSet, ClientError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let object = format!(
            "replicaset/{}",
            rs.metadata.name.as_deref().unwrap_or_default()
        );
        self.bounded(&object, api.create(&PostParams::default(), rs))
            .await
    }

    async fn scale_replica_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClientError> {
        self.update_replica_set(namespace, name, |rs| {
            if let Some(spec) = rs.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
        })
        .await
    }

    async fn annotate_replica_set(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), ClientError> {
        self.update_replica_set(namespace, name, |rs| {
            let annotations = rs.metadata.annotations.get_or_insert_with(Default::default);
            match &value {
                Some(v) => {
                    annotations.insert(key.to_string(), v.clone());
                }
                None => {
                    annotations.remove(key);
                }
            }
        })
        .await
    }

    async fn list_services(
        &self,
        namespace: &str,
        experiment: &str,
    ) -> Result<Vec<Service>, ClientError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded("services", api.list(&experiment_selector(experiment)))
            .await?;
        Ok(list.items)
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service, ClientError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let object = format!(
            "service/{}",
            svc.metadata.name.as_deref().unwrap_or_default()
        );
        self.bounded(&object, api.create(&PostParams::default(), svc))
            .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match self
            .bounded(
                &format!("service/{}", name),
                api.delete(name, &DeleteParams::default()),
            )
            .await
        {
            Ok(_) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => {
                warn!(service = %name, error = %e, "Failed to delete Service");
                Err(e)
            }
        }
    }

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), ClientError> {
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        self.bounded(
            &format!("experiment/{}", name),
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map(|_| ())
    }
}
