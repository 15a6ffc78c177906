//! Lifecycle error types.

use thiserror::Error;

use chaldeploy_core::TenantKeyError;
use chaldeploy_orchestrator::OrchestrationError;

use crate::instance::InstancePhase;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors from the instance lifecycle manager.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no deployment exists for team {0}")]
    UnknownTenant(String),

    #[error("deployment for team {tenant} is {phase}, not running")]
    NotRunning { tenant: String, phase: InstancePhase },

    #[error("deployment for team {0} has already expired")]
    Expired(String),

    #[error("deployment for team {0} is still being torn down")]
    TearingDown(String),

    #[error("team {tenant} can't be deployed: {reason}")]
    InvalidTenant {
        tenant: String,
        #[source]
        reason: TenantKeyError,
    },

    #[error("expiration of team {0} is out of range")]
    ExpirationOverflow(String),

    #[error("illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: InstancePhase,
        to: InstancePhase,
    },

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

impl LifecycleError {
    /// Whether the request was rejected because of the instance's state
    /// rather than a failure. Such rejections mutate nothing.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            LifecycleError::UnknownTenant(_)
                | LifecycleError::NotRunning { .. }
                | LifecycleError::Expired(_)
                | LifecycleError::TearingDown(_)
                | LifecycleError::InvalidTenant { .. }
        )
    }

    /// Whether the backend took too long to create or delete resources.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LifecycleError::Orchestration(e) if e.is_timeout())
    }
}
