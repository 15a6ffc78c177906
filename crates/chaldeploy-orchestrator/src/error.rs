//! Backend and orchestration error types.

use thiserror::Error;

use crate::resources::ResourceKind;

/// Result type alias for raw backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type alias for driver operations.
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Errors reported by a [`ClusterBackend`](crate::ClusterBackend).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("client error: {0}")]
    Client(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

impl From<kube::Error> for BackendError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => BackendError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 => {
                BackendError::AlreadyExists(resp.message)
            }
            kube::Error::Api(resp) => {
                BackendError::Api(format!("{} ({}: {})", resp.message, resp.code, resp.reason))
            }
            other => BackendError::Client(other.to_string()),
        }
    }
}

/// Errors from the create/destroy/extend protocols.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("failed to create the {kind} for {name}: {source}")]
    Create {
        kind: ResourceKind,
        name: String,
        source: BackendError,
    },

    #[error("failed to look up the {kind} for {name}: {source}")]
    Lookup {
        kind: ResourceKind,
        name: String,
        source: BackendError,
    },

    #[error("failed to delete {kind} {name}: {source}")]
    Delete {
        kind: ResourceKind,
        name: String,
        source: BackendError,
    },

    #[error("couldn't update the expiration label on {name}: {source}")]
    LabelUpdate { name: String, source: BackendError },

    #[error("couldn't list managed resource groups: {0}")]
    List(#[source] BackendError),

    #[error("timed out waiting for challenge to finish deploying for {name} ({attempts} attempts)")]
    ReadyTimeout { name: String, attempts: u32 },

    #[error("failed to delete {name}: took too long to delete resource ({attempts} attempts)")]
    TeardownTimeout { name: String, attempts: u32 },

    #[error("endpoint for {0} has no routable address")]
    NoAddress(String),
}

impl OrchestrationError {
    /// Whether the poller gave up waiting on the backend.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ReadyTimeout { .. } | OrchestrationError::TeardownTimeout { .. }
        )
    }
}
