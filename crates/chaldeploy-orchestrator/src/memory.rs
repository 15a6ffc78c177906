//! In-memory [`ClusterBackend`] for tests and local runs.
//!
//! Mimics the eventual consistency of a real cluster: a new endpoint only
//! reports an address after a configurable number of status reads, and a
//! deleted resource group stays visible for a configurable number of
//! lookups. Individual operations can be made to fail, and every call is
//! counted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::backend::ClusterBackend;
use crate::error::{BackendError, BackendResult};
use crate::resources::{
    EndpointSpec, EndpointStatus, Labels, ResourceGroup, ResourceGroupSpec, WorkloadSpec,
    WorkloadStatus,
};

/// Backend operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateResourceGroup,
    GetResourceGroup,
    ListResourceGroups,
    DeleteResourceGroup,
    SetResourceGroupLabel,
    CreateWorkload,
    GetWorkload,
    CreateEndpoint,
    GetEndpoint,
}

#[derive(Debug)]
struct MemoryWorkload {
    /// `None` for seeded workloads.
    spec: Option<WorkloadSpec>,
    ready_replicas: i32,
}

#[derive(Debug)]
struct MemoryEndpoint {
    spec: Option<EndpointSpec>,
    reads: u32,
    address: Option<String>,
    /// Never assigned an address.
    pending: bool,
}

#[derive(Debug)]
struct MemoryGroup {
    labels: Labels,
    workloads: BTreeMap<String, MemoryWorkload>,
    endpoints: BTreeMap<String, MemoryEndpoint>,
    /// Lookups left before a deleted group disappears.
    terminating: Option<u32>,
}

#[derive(Debug, Default)]
struct MemoryState {
    groups: BTreeMap<String, MemoryGroup>,
    /// Endpoint status reads before an address is assigned.
    ready_after: u32,
    /// Lookups a deleted group stays visible for.
    visible_after_delete: u32,
    /// Endpoints never get an address.
    never_ready: bool,
    failing: HashSet<Operation>,
    calls: HashMap<Operation, u32>,
    next_address: u32,
}

/// Thread-safe in-memory cluster.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// A backend where endpoints are ready on the first read and deleted
    /// groups vanish immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints report an address on the `reads`-th status read.
    pub fn with_ready_after(self, reads: u32) -> Self {
        self.lock().ready_after = reads;
        self
    }

    /// Deleted groups remain visible to `lookups` further lookups.
    pub fn with_visible_after_delete(self, lookups: u32) -> Self {
        self.lock().visible_after_delete = lookups;
        self
    }

    /// Endpoints never receive an address.
    pub fn with_never_ready(self) -> Self {
        self.lock().never_ready = true;
        self
    }

    /// Make every call to `op` fail until [`heal`](Self::heal) is called.
    pub fn fail(&self, op: Operation) {
        self.lock().failing.insert(op);
    }

    pub fn heal(&self, op: Operation) {
        self.lock().failing.remove(&op);
    }

    /// Number of calls made to `op` so far, failed ones included.
    pub fn calls(&self, op: Operation) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Whether a group exists (including one still terminating).
    pub fn contains_group(&self, name: &str) -> bool {
        self.lock().groups.contains_key(name)
    }

    pub fn group_labels(&self, name: &str) -> Option<Labels> {
        self.lock().groups.get(name).map(|g| g.labels.clone())
    }

    pub fn workload(&self, group: &str, name: &str) -> Option<WorkloadSpec> {
        self.lock()
            .groups
            .get(group)
            .and_then(|g| g.workloads.get(name))
            .and_then(|w| w.spec.clone())
    }

    /// Set how many replicas of a workload report ready.
    pub fn set_ready_replicas(&self, group: &str, name: &str, ready: i32) {
        if let Some(workload) = self
            .lock()
            .groups
            .get_mut(group)
            .and_then(|g| g.workloads.get_mut(name))
        {
            workload.ready_replicas = ready;
        }
    }

    /// Insert a running group directly, as if left behind by an earlier
    /// process: one ready workload and one endpoint, both named `app`.
    /// `address` of `None` leaves the endpoint without an address forever.
    pub fn seed_group(&self, spec: ResourceGroupSpec, app: &str, address: Option<&str>) {
        let mut state = self.lock();
        let workloads = BTreeMap::from([(
            app.to_string(),
            MemoryWorkload {
                spec: None,
                ready_replicas: 1,
            },
        )]);
        let endpoints = BTreeMap::from([(
            app.to_string(),
            MemoryEndpoint {
                spec: None,
                reads: 0,
                address: address.map(str::to_string),
                pending: address.is_none(),
            },
        )]);
        state.groups.insert(
            spec.name.clone(),
            MemoryGroup {
                labels: spec.labels,
                workloads,
                endpoints,
                terminating: None,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Every mutation completes under a single guard, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call and apply failure injection.
    fn enter(&self, op: Operation) -> BackendResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if state.failing.contains(&op) {
            debug!(?op, "injected backend failure");
            return Err(BackendError::Api(format!("injected failure for {op:?}")));
        }
        Ok(state)
    }
}

impl MemoryState {
    fn group_mut(&mut self, name: &str) -> BackendResult<&mut MemoryGroup> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(format!("resource group \"{name}\" not found")))
    }

    fn endpoint_mut(&mut self, group: &str, name: &str) -> BackendResult<&mut MemoryEndpoint> {
        self.group_mut(group)?
            .endpoints
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(format!("endpoint \"{name}\" not found")))
    }

    fn allocate_address(&mut self) -> String {
        self.next_address += 1;
        format!("203.0.113.{}", self.next_address % 254 + 1)
    }
}

fn matches_selector(labels: &Labels, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterBackend for MemoryBackend {
    async fn create_resource_group(&self, spec: &ResourceGroupSpec) -> BackendResult<()> {
        let mut state = self.enter(Operation::CreateResourceGroup)?;
        if state.groups.contains_key(&spec.name) {
            return Err(BackendError::AlreadyExists(format!(
                "resource group \"{}\" already exists",
                spec.name
            )));
        }
        state.groups.insert(
            spec.name.clone(),
            MemoryGroup {
                labels: spec.labels.clone(),
                workloads: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                terminating: None,
            },
        );
        Ok(())
    }

    async fn get_resource_group(&self, name: &str) -> BackendResult<ResourceGroup> {
        let mut state = self.enter(Operation::GetResourceGroup)?;
        let group = state.group_mut(name)?;
        let labels = group.labels.clone();
        let terminating = group.terminating;
        match terminating {
            Some(0) => {
                state.groups.remove(name);
                return Err(BackendError::NotFound(format!(
                    "resource group \"{name}\" not found"
                )));
            }
            Some(left) => state.group_mut(name)?.terminating = Some(left - 1),
            None => {}
        }
        Ok(ResourceGroup {
            name: name.to_string(),
            labels,
        })
    }

    async fn list_resource_groups(&self, selector: &str) -> BackendResult<Vec<ResourceGroup>> {
        let state = self.enter(Operation::ListResourceGroups)?;
        Ok(state
            .groups
            .iter()
            .filter(|(_, g)| matches_selector(&g.labels, selector))
            .map(|(name, g)| ResourceGroup {
                name: name.clone(),
                labels: g.labels.clone(),
            })
            .collect())
    }

    async fn delete_resource_group(&self, name: &str) -> BackendResult<()> {
        let mut state = self.enter(Operation::DeleteResourceGroup)?;
        let visible = state.visible_after_delete;
        let group = state.group_mut(name)?;
        if group.terminating.is_none() {
            group.terminating = Some(visible);
        }
        Ok(())
    }

    async fn set_resource_group_label(
        &self,
        name: &str,
        key: &str,
        value: &str,
    ) -> BackendResult<()> {
        let mut state = self.enter(Operation::SetResourceGroupLabel)?;
        state
            .group_mut(name)?
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn create_workload(&self, group: &str, spec: &WorkloadSpec) -> BackendResult<()> {
        let mut state = self.enter(Operation::CreateWorkload)?;
        let group = state.group_mut(group)?;
        if group.workloads.contains_key(&spec.name) {
            return Err(BackendError::AlreadyExists(format!(
                "workload \"{}\" already exists",
                spec.name
            )));
        }
        group.workloads.insert(
            spec.name.clone(),
            MemoryWorkload {
                spec: Some(spec.clone()),
                ready_replicas: spec.replicas,
            },
        );
        Ok(())
    }

    async fn get_workload(&self, group: &str, name: &str) -> BackendResult<WorkloadStatus> {
        let mut state = self.enter(Operation::GetWorkload)?;
        let group = state.group_mut(group)?;
        match group.workloads.get(name) {
            Some(workload) => Ok(WorkloadStatus {
                name: name.to_string(),
                ready_replicas: workload.ready_replicas,
            }),
            None => Err(BackendError::NotFound(format!("workload \"{name}\" not found"))),
        }
    }

    async fn create_endpoint(&self, group: &str, spec: &EndpointSpec) -> BackendResult<()> {
        let mut state = self.enter(Operation::CreateEndpoint)?;
        let group = state.group_mut(group)?;
        if group.endpoints.contains_key(&spec.name) {
            return Err(BackendError::AlreadyExists(format!(
                "endpoint \"{}\" already exists",
                spec.name
            )));
        }
        group.endpoints.insert(
            spec.name.clone(),
            MemoryEndpoint {
                spec: Some(spec.clone()),
                reads: 0,
                address: None,
                pending: false,
            },
        );
        Ok(())
    }

    async fn get_endpoint(&self, group: &str, name: &str) -> BackendResult<EndpointStatus> {
        let mut state = self.enter(Operation::GetEndpoint)?;
        let ready_after = state.ready_after;
        let never_ready = state.never_ready;

        let needs_address = {
            let endpoint = state.endpoint_mut(group, name)?;
            endpoint.reads += 1;
            let external = endpoint.spec.as_ref().is_none_or(|s| s.external);
            endpoint.address.is_none()
                && external
                && !never_ready
                && !endpoint.pending
                && endpoint.reads >= ready_after
        };
        if needs_address {
            let address = state.allocate_address();
            state.endpoint_mut(group, name)?.address = Some(address);
        }

        let endpoint = state.endpoint_mut(group, name)?;
        Ok(EndpointStatus {
            name: name.to_string(),
            external_address: endpoint.address.clone(),
        })
    }
}
