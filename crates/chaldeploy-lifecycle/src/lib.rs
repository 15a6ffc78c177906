//! chaldeploy-lifecycle — per-team instance lifecycle.
//!
//! - [`instance`] — the `Destroyed → Running → Destroying → Destroyed`
//!   state machine, guarded by a per-instance lock
//! - [`registry`] — team id → instance, with idempotent first insertion
//! - [`manager`] — create / extend / destroy / status, the single-pass
//!   expiration sweep and startup reconciliation
//!
//! The manager owns no timers; the daemon schedules the sweep.

pub mod error;
pub mod instance;
pub mod manager;
pub mod registry;

pub use error::{LifecycleError, LifecycleResult};
pub use instance::{DeploymentInstance, InstanceGuard, InstancePhase, InstanceSnapshot};
pub use manager::InstanceManager;
pub use registry::InstanceRegistry;
