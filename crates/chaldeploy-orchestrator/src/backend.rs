//! The cluster primitives the driver needs.

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::resources::{
    EndpointSpec, EndpointStatus, ResourceGroup, ResourceGroupSpec, WorkloadSpec, WorkloadStatus,
};

/// A container-orchestration API offering resource groups, workloads and
/// network endpoints.
///
/// Lookups of absent objects must fail with
/// [`BackendError::NotFound`](crate::BackendError::NotFound); the driver
/// relies on it to detect completed deletions.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn create_resource_group(&self, spec: &ResourceGroupSpec) -> BackendResult<()>;

    async fn get_resource_group(&self, name: &str) -> BackendResult<ResourceGroup>;

    /// List resource groups matching a `key=value,key=value` selector.
    async fn list_resource_groups(&self, selector: &str) -> BackendResult<Vec<ResourceGroup>>;

    /// Delete a resource group and, transitively, everything inside it.
    ///
    /// Returns once the deletion is accepted; the group may linger while
    /// its contents terminate.
    async fn delete_resource_group(&self, name: &str) -> BackendResult<()>;

    /// Set a single label on a resource group. Last write wins.
    async fn set_resource_group_label(&self, name: &str, key: &str, value: &str)
    -> BackendResult<()>;

    async fn create_workload(&self, group: &str, spec: &WorkloadSpec) -> BackendResult<()>;

    async fn get_workload(&self, group: &str, name: &str) -> BackendResult<WorkloadStatus>;

    async fn create_endpoint(&self, group: &str, spec: &EndpointSpec) -> BackendResult<()>;

    async fn get_endpoint(&self, group: &str, name: &str) -> BackendResult<EndpointStatus>;
}
