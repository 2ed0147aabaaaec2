use crate::controller::experiment::replicaset::{managed_annotations, owned_labels};
use crate::crd::experiment::Experiment;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Build the Service fronting a template's ReplicaSet
///
/// The Service shares the ReplicaSet's name, selects its pods and exposes
/// every container port of the pod template.
pub fn build_service(experiment: &Experiment, template: &str, rs: &ReplicaSet) -> Service {
    let name = rs.name_any();

    let selector = rs
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone());

    let ports: Vec<ServicePort> = rs
        .spec
        .as_ref()
        .and_then(|s| s.template.as_ref())
        .and_then(|t| t.spec.as_ref())
        .map(|pod| {
            pod.containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .map(|p| ServicePort {
                    name: p.name.clone(),
                    port: p.container_port,
                    protocol: p.protocol.clone(),
                    target_port: Some(IntOrString::Int(p.container_port)),
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default();

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: experiment.namespace(),
            labels: Some(owned_labels(&experiment.name_any(), template)),
            annotations: Some(managed_annotations()),
            owner_references: experiment.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector,
            ports: if ports.is_empty() { None } else { Some(ports) },
            ..Default::default()
        }),
        status: None,
    }
}
