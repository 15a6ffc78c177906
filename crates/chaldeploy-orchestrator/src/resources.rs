//! Backend-neutral resource descriptors.
//!
//! A team instance is three resources: a resource group (a namespace on
//! Kubernetes) holding one workload and one network endpoint. The
//! [`InstanceTemplate`] builds all three from the challenge config.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use chaldeploy_core::{labels, ChallengeConfig, ChallengeIdentity, image_name};

/// String label map, ordered for stable output.
pub type Labels = BTreeMap<String, String>;

/// The three resource kinds an instance is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ResourceGroup,
    Workload,
    Endpoint,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ResourceGroup => f.write_str("resource group"),
            ResourceKind::Workload => f.write_str("workload"),
            ResourceKind::Endpoint => f.write_str("endpoint"),
        }
    }
}

/// Desired resource group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupSpec {
    pub name: String,
    pub labels: Labels,
}

/// Desired single-container workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    /// Labels on the workload and its pod template. Always a superset of
    /// `selector`.
    pub labels: Labels,
    pub selector: Labels,
    pub container_name: String,
    pub image: String,
    pub port: u16,
    pub replicas: i32,
}

/// Desired network endpoint in front of the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub name: String,
    pub labels: Labels,
    pub selector: Labels,
    pub port: u16,
    /// Request an externally routable address.
    pub external: bool,
}

/// Resource group as observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroup {
    pub name: String,
    pub labels: Labels,
}

/// Workload as observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub name: String,
    pub ready_replicas: i32,
}

/// Network endpoint as observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub name: String,
    /// Routable address, once the backend has assigned one.
    pub external_address: Option<String>,
}

impl ResourceGroup {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Builds the descriptors for one team's instance of the challenge.
#[derive(Debug, Clone)]
pub struct InstanceTemplate {
    identity: ChallengeIdentity,
    image: String,
    port: u16,
}

impl InstanceTemplate {
    pub fn new(identity: ChallengeIdentity, image: &str, port: u16) -> Self {
        Self {
            identity,
            image: image.to_string(),
            port,
        }
    }

    pub fn from_config(config: &ChallengeConfig) -> Self {
        Self::new(
            ChallengeIdentity::new(&config.challenge_name),
            &config.challenge_image,
            config.challenge_port,
        )
    }

    pub fn identity(&self) -> &ChallengeIdentity {
        &self.identity
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Name of the workload and endpoint inside a resource group.
    ///
    /// They share the group's name, which is unique per team.
    pub fn app_name<'a>(&self, group: &'a str) -> &'a str {
        group
    }

    /// Selector shared by the workload's pods and the endpoint.
    pub fn selector(&self, group: &str, tenant_key: &str) -> Labels {
        Labels::from([
            (labels::APP.to_string(), self.app_name(group).to_string()),
            (labels::CHALLENGE.to_string(), self.identity.hash().to_string()),
            (labels::TEAM_ID.to_string(), tenant_key.to_string()),
        ])
    }

    fn object_labels(&self, group: &str, tenant_key: &str) -> Labels {
        let mut object_labels = self.selector(group, tenant_key);
        object_labels.insert(
            labels::APP_MANAGED_BY.to_string(),
            labels::APP_MANAGED_BY_VALUE.to_string(),
        );
        object_labels
    }

    /// Resource group tagged for reconciliation, with a planned expiration.
    pub fn resource_group(
        &self,
        group: &str,
        tenant_key: &str,
        expires_at: DateTime<Utc>,
    ) -> ResourceGroupSpec {
        ResourceGroupSpec {
            name: group.to_string(),
            labels: Labels::from([
                (
                    labels::APP_MANAGED_BY.to_string(),
                    labels::APP_MANAGED_BY_VALUE.to_string(),
                ),
                (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string()),
                (labels::CHALLENGE.to_string(), self.identity.hash().to_string()),
                (labels::TEAM_ID.to_string(), tenant_key.to_string()),
                (
                    labels::EXPIRATION_TIME.to_string(),
                    expires_at.timestamp().to_string(),
                ),
            ]),
        }
    }

    /// Single replica of the challenge image.
    pub fn workload(&self, group: &str, tenant_key: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: self.app_name(group).to_string(),
            labels: self.object_labels(group, tenant_key),
            selector: self.selector(group, tenant_key),
            container_name: image_name(&self.image).to_string(),
            image: self.image.clone(),
            port: self.port,
            replicas: 1,
        }
    }

    /// Externally routable endpoint exposing the challenge port.
    pub fn endpoint(&self, group: &str, tenant_key: &str) -> EndpointSpec {
        EndpointSpec {
            name: self.app_name(group).to_string(),
            labels: self.object_labels(group, tenant_key),
            selector: self.selector(group, tenant_key),
            port: self.port,
            external: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> InstanceTemplate {
        InstanceTemplate::new(
            ChallengeIdentity::new("test chal"),
            "registry.example.com/ctf/test-nc:latest",
            1337,
        )
    }

    #[test]
    fn resource_group_carries_reconciliation_labels() {
        let t = template();
        let expires = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let spec = t.resource_group("grp", "team-1", expires);

        assert_eq!(spec.name, "grp");
        assert_eq!(spec.labels[labels::MANAGED_BY], "yes");
        assert_eq!(spec.labels[labels::CHALLENGE], t.identity().hash());
        assert_eq!(spec.labels[labels::TEAM_ID], "team-1");
        assert_eq!(spec.labels[labels::EXPIRATION_TIME], "1700000000");
        assert_eq!(spec.labels[labels::APP_MANAGED_BY], "chaldeploy");
    }

    #[test]
    fn workload_uses_image_and_port() {
        let spec = template().workload("grp", "team-1");
        assert_eq!(spec.name, "grp");
        assert_eq!(spec.container_name, "test-nc");
        assert_eq!(spec.image, "registry.example.com/ctf/test-nc:latest");
        assert_eq!(spec.port, 1337);
        assert_eq!(spec.replicas, 1);
    }

    #[test]
    fn pod_labels_cover_selector() {
        let t = template();
        let workload = t.workload("grp", "team-1");
        for (k, v) in &workload.selector {
            assert_eq!(workload.labels.get(k), Some(v));
        }
        let endpoint = t.endpoint("grp", "team-1");
        assert_eq!(endpoint.selector, workload.selector);
        assert!(endpoint.external);
        assert_eq!(endpoint.port, 1337);
    }

    #[test]
    fn kind_display() {
        assert_eq!(ResourceKind::ResourceGroup.to_string(), "resource group");
        assert_eq!(ResourceKind::Workload.to_string(), "workload");
        assert_eq!(ResourceKind::Endpoint.to_string(), "endpoint");
    }
}
