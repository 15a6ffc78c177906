//! Kubernetes implementation of [`ClusterBackend`].
//!
//! Resource group → `Namespace`, workload → `apps/v1 Deployment`,
//! endpoint → `Service` of type `LoadBalancer`.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec, SecurityContext, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::backend::ClusterBackend;
use crate::error::{BackendError, BackendResult};
use crate::resources::{
    EndpointSpec, EndpointStatus, ResourceGroup, ResourceGroupSpec, WorkloadSpec, WorkloadStatus,
};

/// Cluster backend driving a Kubernetes API server.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig, or infer one.
    ///
    /// Inference tries the in-cluster service account first, then the
    /// current context of `~/.kube/config`.
    pub async fn connect(kubeconfig: Option<&Path>) -> BackendResult<Self> {
        let config = match kubeconfig {
            Some(path) => {
                if !path.exists() {
                    return Err(BackendError::Client(format!(
                        "specified kubeconfig {} doesn't exist",
                        path.display()
                    )));
                }
                info!(path = %path.display(), "using kubeconfig from configuration");
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| BackendError::Client(e.to_string()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| BackendError::Client(e.to_string()))?
            }
            None => {
                info!("no kubeconfig configured, inferring cluster config");
                Config::infer()
                    .await
                    .map_err(|e| BackendError::Client(e.to_string()))?
            }
        };

        debug!(cluster_url = %config.cluster_url, "kubernetes client configured");
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn deployments(&self, group: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), group)
    }

    fn services(&self, group: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), group)
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn create_resource_group(&self, spec: &ResourceGroupSpec) -> BackendResult<()> {
        self.namespaces()
            .create(&PostParams::default(), &to_namespace(spec))
            .await?;
        Ok(())
    }

    async fn get_resource_group(&self, name: &str) -> BackendResult<ResourceGroup> {
        let ns = self.namespaces().get(name).await?;
        Ok(from_namespace(ns))
    }

    async fn list_resource_groups(&self, selector: &str) -> BackendResult<Vec<ResourceGroup>> {
        let list = self
            .namespaces()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.into_iter().map(from_namespace).collect())
    }

    async fn delete_resource_group(&self, name: &str) -> BackendResult<()> {
        self.namespaces()
            .delete(name, &DeleteParams::foreground())
            .await?;
        Ok(())
    }

    async fn set_resource_group_label(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> BackendResult<()> {
        let patch = serde_json::json!({
            "metadata": { "labels": { key: value } }
        });
        self.namespaces()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_workload(&self, group: &str, spec: &WorkloadSpec) -> BackendResult<()> {
        self.deployments(group)
            .create(&PostParams::default(), &to_deployment(spec))
            .await?;
        Ok(())
    }

    async fn get_workload(&self, group: &str, name: &str) -> BackendResult<WorkloadStatus> {
        let deployment = self.deployments(group).get(name).await?;
        Ok(WorkloadStatus {
            name: deployment.metadata.name.unwrap_or_default(),
            ready_replicas: deployment
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        })
    }

    async fn create_endpoint(&self, group: &str, spec: &EndpointSpec) -> BackendResult<()> {
        self.services(group)
            .create(&PostParams::default(), &to_service(spec))
            .await?;
        Ok(())
    }

    async fn get_endpoint(&self, group: &str, name: &str) -> BackendResult<EndpointStatus> {
        let service = self.services(group).get(name).await?;
        Ok(EndpointStatus {
            name: service.metadata.name.clone().unwrap_or_default(),
            external_address: load_balancer_address(&service),
        })
    }
}

fn to_namespace(spec: &ResourceGroupSpec) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn from_namespace(ns: Namespace) -> ResourceGroup {
    ResourceGroup {
        name: ns.metadata.name.unwrap_or_default(),
        labels: ns.metadata.labels.unwrap_or_default(),
    }
}

fn to_deployment(spec: &WorkloadSpec) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(spec.selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    automount_service_account_token: Some(false),
                    containers: vec![Container {
                        name: spec.container_name.clone(),
                        image: Some(spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: i32::from(spec.port),
                            ..Default::default()
                        }]),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(false),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn to_service(spec: &EndpointSpec) -> Service {
    let service_type = if spec.external { "LoadBalancer" } else { "ClusterIP" };
    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: i32::from(spec.port),
                target_port: Some(IntOrString::Int(i32::from(spec.port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(spec.selector.clone()),
            type_: Some(service_type.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// First non-empty ingress IP or hostname assigned to a load balancer.
fn load_balancer_address(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| {
            ingress
                .ip
                .clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| ingress.hostname.clone().filter(|h| !h.is_empty()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::InstanceTemplate;
    use chaldeploy_core::ChallengeIdentity;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn template() -> InstanceTemplate {
        InstanceTemplate::new(ChallengeIdentity::new("chal"), "ctf/test-nc:v2", 9999)
    }

    fn service_with_ingress(ingress: Vec<LoadBalancerIngress>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(ingress),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn deployment_is_locked_down() {
        let deployment = to_deployment(&template().workload("grp", "team-1"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.automount_service_account_token, Some(false));
        let container = &pod.containers[0];
        assert_eq!(container.name, "test-nc");
        assert_eq!(container.image.as_deref(), Some("ctf/test-nc:v2"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 9999);
        assert_eq!(
            container
                .security_context
                .as_ref()
                .and_then(|s| s.allow_privilege_escalation),
            Some(false)
        );
    }

    #[test]
    fn service_requests_load_balancer() {
        let service = to_service(&template().endpoint("grp", "team-1"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 9999);
        assert_eq!(port.target_port, Some(IntOrString::Int(9999)));
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
    }

    #[test]
    fn namespace_round_trips_labels() {
        let expires = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let spec = template().resource_group("grp", "team-1", expires);
        let group = from_namespace(to_namespace(&spec));
        assert_eq!(group.name, "grp");
        assert_eq!(group.labels, spec.labels);
    }

    #[test]
    fn address_prefers_ip_then_hostname() {
        let no_status = Service::default();
        assert_eq!(load_balancer_address(&no_status), None);

        let pending = service_with_ingress(vec![]);
        assert_eq!(load_balancer_address(&pending), None);

        let ip = service_with_ingress(vec![LoadBalancerIngress {
            ip: Some("34.1.2.3".to_string()),
            ..Default::default()
        }]);
        assert_eq!(load_balancer_address(&ip).as_deref(), Some("34.1.2.3"));

        let hostname = service_with_ingress(vec![LoadBalancerIngress {
            ip: Some(String::new()),
            hostname: Some("lb.example.com".to_string()),
            ..Default::default()
        }]);
        assert_eq!(load_balancer_address(&hostname).as_deref(), Some("lb.example.com"));
    }
}
