//! Orchestration driver — the create / destroy / extend protocols.
//!
//! The driver is stateless: it issues backend calls for one resource group
//! at a time and blocks on the [`Poller`] until the backend catches up.
//! Callers serialize operations per team.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use chaldeploy_core::labels;

use crate::backend::ClusterBackend;
use crate::error::{BackendError, OrchestrationError, OrchestrationResult};
use crate::poller::{PollOutcome, Poller};
use crate::resources::{InstanceTemplate, ResourceKind};

/// Host placeholder when a running instance's address is not known.
pub const UNKNOWN_HOST: &str = "<unknown>";
/// Port placeholder when a running instance's address is not known.
pub const UNKNOWN_PORT: i32 = -1;

/// Where a team connects to its instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: i32,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port: i32::from(port),
        }
    }

    /// Sentinel for an instance recovered without a readable address.
    pub fn unknown() -> Self {
        Self {
            host: UNKNOWN_HOST.to_string(),
            port: UNKNOWN_PORT,
        }
    }

    pub fn is_known(&self) -> bool {
        self.port != UNKNOWN_PORT
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How a teardown completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The resource group did not exist.
    AlreadyAbsent,
    /// The resource group was deleted and is confirmed gone.
    Deleted,
}

/// A running instance found on the backend at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    pub tenant_key: String,
    pub group_name: String,
    pub expires_at: DateTime<Utc>,
    pub endpoint: Endpoint,
}

/// Drives a [`ClusterBackend`] through the instance protocols.
#[derive(Clone)]
pub struct OrchestrationDriver {
    backend: Arc<dyn ClusterBackend>,
    template: InstanceTemplate,
    poller: Poller,
}

impl OrchestrationDriver {
    pub fn new(backend: Arc<dyn ClusterBackend>, template: InstanceTemplate, poller: Poller) -> Self {
        Self {
            backend,
            template,
            poller,
        }
    }

    pub fn template(&self) -> &InstanceTemplate {
        &self.template
    }

    /// Create the resource group, workload and endpoint for a team, then
    /// wait for the endpoint to become routable.
    ///
    /// If anything fails after the resource group exists, the group is
    /// deleted again on a best-effort basis and the original error is
    /// returned.
    pub async fn provision(
        &self,
        group: &str,
        tenant_key: &str,
        expires_at: DateTime<Utc>,
    ) -> OrchestrationResult<Endpoint> {
        let group_spec = self.template.resource_group(group, tenant_key, expires_at);
        self.backend
            .create_resource_group(&group_spec)
            .await
            .map_err(|source| OrchestrationError::Create {
                kind: ResourceKind::ResourceGroup,
                name: group.to_string(),
                source,
            })?;
        debug!(%group, %tenant_key, "resource group created");

        match self.provision_contents(group, tenant_key).await {
            Ok(endpoint) => {
                info!(%group, %tenant_key, %endpoint, "instance provisioned");
                Ok(endpoint)
            }
            Err(err) => {
                warn!(%group, %tenant_key, error = %err, "provisioning failed, discarding resource group");
                self.discard(group).await;
                Err(err)
            }
        }
    }

    async fn provision_contents(
        &self,
        group: &str,
        tenant_key: &str,
    ) -> OrchestrationResult<Endpoint> {
        let workload = self.template.workload(group, tenant_key);
        self.backend
            .create_workload(group, &workload)
            .await
            .map_err(|source| OrchestrationError::Create {
                kind: ResourceKind::Workload,
                name: group.to_string(),
                source,
            })?;

        let endpoint = self.template.endpoint(group, tenant_key);
        self.backend
            .create_endpoint(group, &endpoint)
            .await
            .map_err(|source| OrchestrationError::Create {
                kind: ResourceKind::Endpoint,
                name: group.to_string(),
                source,
            })?;

        let outcome = self
            .poller
            .poll_until(&format!("{group} routable"), || self.endpoint_routable(group))
            .await;
        if let PollOutcome::Exhausted { attempts } = outcome {
            return Err(OrchestrationError::ReadyTimeout {
                name: group.to_string(),
                attempts,
            });
        }

        let status = self
            .backend
            .get_endpoint(group, &endpoint.name)
            .await
            .map_err(|source| OrchestrationError::Lookup {
                kind: ResourceKind::Endpoint,
                name: group.to_string(),
                source,
            })?;
        let host = status
            .external_address
            .ok_or_else(|| OrchestrationError::NoAddress(group.to_string()))?;

        Ok(Endpoint::new(&host, self.template.port()))
    }

    async fn endpoint_routable(&self, group: &str) -> bool {
        let name = self.template.app_name(group);
        match self.backend.get_endpoint(group, name).await {
            Ok(status) => status.external_address.is_some(),
            Err(e) => {
                debug!(%group, error = %e, "endpoint status unavailable");
                false
            }
        }
    }

    /// Best-effort removal of a half-built resource group.
    async fn discard(&self, group: &str) {
        match self.backend.delete_resource_group(group).await {
            Ok(()) => debug!(%group, "partial resource group deletion requested"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%group, error = %e, "couldn't discard partial resource group, it may be orphaned"),
        }
    }

    /// Delete a resource group with foreground cascading and wait until
    /// the backend no longer reports it.
    pub async fn teardown(&self, group: &str) -> OrchestrationResult<Teardown> {
        match self.backend.get_resource_group(group).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(%group, "resource group already absent");
                return Ok(Teardown::AlreadyAbsent);
            }
            Err(source) => {
                return Err(OrchestrationError::Lookup {
                    kind: ResourceKind::ResourceGroup,
                    name: group.to_string(),
                    source,
                });
            }
        }

        match self.backend.delete_resource_group(group).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(Teardown::AlreadyAbsent),
            Err(source) => {
                return Err(OrchestrationError::Delete {
                    kind: ResourceKind::ResourceGroup,
                    name: group.to_string(),
                    source,
                });
            }
        }

        let outcome = self
            .poller
            .poll_until(&format!("{group} gone"), || self.group_absent(group))
            .await;
        match outcome {
            PollOutcome::Ready { attempts } => {
                info!(%group, attempts, "resource group deleted");
                Ok(Teardown::Deleted)
            }
            PollOutcome::Exhausted { attempts } => Err(OrchestrationError::TeardownTimeout {
                name: group.to_string(),
                attempts,
            }),
        }
    }

    async fn group_absent(&self, group: &str) -> bool {
        matches!(
            self.backend.get_resource_group(group).await,
            Err(BackendError::NotFound(_))
        )
    }

    /// Rewrite the expiration label of a resource group.
    pub async fn update_expiration(
        &self,
        group: &str,
        expires_at: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        self.backend
            .get_resource_group(group)
            .await
            .map_err(|source| OrchestrationError::Lookup {
                kind: ResourceKind::ResourceGroup,
                name: group.to_string(),
                source,
            })?;

        self.backend
            .set_resource_group_label(
                group,
                labels::EXPIRATION_TIME,
                &expires_at.timestamp().to_string(),
            )
            .await
            .map_err(|source| OrchestrationError::LabelUpdate {
                name: group.to_string(),
                source,
            })?;

        debug!(%group, %expires_at, "expiration label updated");
        Ok(())
    }

    /// Find running instances of this challenge left by an earlier process.
    ///
    /// A missing or unparsable expiration label yields `fallback_expiry`.
    /// An instance whose workload has no ready replica, or whose endpoint
    /// has no readable address, yields [`Endpoint::unknown`].
    pub async fn discover(
        &self,
        fallback_expiry: DateTime<Utc>,
    ) -> OrchestrationResult<Vec<DiscoveredInstance>> {
        let selector = labels::managed_selector(self.template.identity().hash());
        let groups = self
            .backend
            .list_resource_groups(&selector)
            .await
            .map_err(OrchestrationError::List)?;

        let mut found = Vec::with_capacity(groups.len());
        for group in groups {
            let Some(tenant_key) = group.label(labels::TEAM_ID).map(str::to_string) else {
                warn!(group = %group.name, "managed resource group has no team label, skipping");
                continue;
            };

            let expires_at = match parse_expiration(group.label(labels::EXPIRATION_TIME)) {
                Some(at) => at,
                None => {
                    warn!(
                        group = %group.name,
                        label = ?group.label(labels::EXPIRATION_TIME),
                        fallback = %fallback_expiry,
                        "couldn't parse expiration time, using default runtime"
                    );
                    fallback_expiry
                }
            };

            let endpoint = if self.workload_ready(&group.name).await {
                self.recovered_endpoint(&group.name).await
            } else {
                Endpoint::unknown()
            };

            found.push(DiscoveredInstance {
                tenant_key,
                group_name: group.name,
                expires_at,
                endpoint,
            });
        }

        Ok(found)
    }

    async fn workload_ready(&self, group: &str) -> bool {
        let app = self.template.app_name(group);
        match self.backend.get_workload(group, app).await {
            Ok(status) if status.ready_replicas > 0 => true,
            Ok(_) => {
                warn!(%group, "existing deployment has no ready replica");
                false
            }
            Err(e) => {
                warn!(%group, error = %e, "couldn't read workload of existing deployment");
                false
            }
        }
    }

    async fn recovered_endpoint(&self, group: &str) -> Endpoint {
        let app = self.template.app_name(group);
        match self.backend.get_endpoint(group, app).await {
            Ok(status) => match status.external_address {
                Some(host) => Endpoint::new(&host, self.template.port()),
                None => {
                    warn!(%group, "existing deployment has no address yet");
                    Endpoint::unknown()
                }
            },
            Err(e) => {
                warn!(%group, error = %e, "couldn't get endpoint when enumerating existing deployments");
                Endpoint::unknown()
            }
        }
    }
}

fn parse_expiration(label: Option<&str>) -> Option<DateTime<Utc>> {
    let secs: i64 = label?.trim().parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}
