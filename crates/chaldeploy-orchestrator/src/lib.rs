//! chaldeploy-orchestrator — turns lifecycle intents into cluster calls.
//!
//! The driver talks to any [`ClusterBackend`]: the Kubernetes backend in
//! production, or the in-memory backend in tests. Asynchronous creation and
//! deletion on the cluster side is bridged by the [`Poller`].
//!
//! # Architecture
//!
//! ```text
//! OrchestrationDriver
//!   ├── InstanceTemplate (resource group / workload / endpoint descriptors)
//!   ├── Poller (initial wait, then 2^n second backoff, bounded attempts)
//!   └── Arc<dyn ClusterBackend>
//!       ├── KubeBackend   (Namespace / Deployment / LoadBalancer Service)
//!       └── MemoryBackend (scriptable, for tests)
//! ```

pub mod backend;
pub mod driver;
pub mod error;
pub mod kube_backend;
pub mod memory;
pub mod poller;
pub mod resources;

pub use backend::ClusterBackend;
pub use driver::{DiscoveredInstance, Endpoint, OrchestrationDriver, Teardown};
pub use error::{BackendError, BackendResult, OrchestrationError, OrchestrationResult};
pub use kube_backend::KubeBackend;
pub use memory::MemoryBackend;
pub use poller::{PollOutcome, Poller};
pub use resources::{
    EndpointSpec, EndpointStatus, InstanceTemplate, ResourceGroup, ResourceGroupSpec,
    ResourceKind, WorkloadSpec, WorkloadStatus,
};
