//! Deployment instance — one team's state machine and metadata.
//!
//! ```text
//!  Destroyed ──create──▶ Running ──destroy──▶ Destroying ──gone──▶ Destroyed
//! ```
//!
//! All mutation goes through an [`InstanceGuard`], which holds the
//! instance's lock for the whole create/extend/destroy operation. Every
//! committed change is published as an [`InstanceSnapshot`] so status
//! reads never wait behind a long-running operation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::debug;

use chaldeploy_orchestrator::Endpoint;

use crate::error::{LifecycleError, LifecycleResult};

/// Shown instead of an expiration time when none is known.
pub const UNKNOWN_EXPIRATION: &str = "<unknown>";

/// Lifecycle phase of a team's instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// No resources exist. Initial state, and re-enterable.
    Destroyed,
    /// Resources exist and the endpoint is routable.
    Running,
    /// Deletion requested, waiting for the backend to confirm.
    Destroying,
}

impl InstancePhase {
    /// The only legal edges of the lifecycle.
    pub fn can_transition_to(self, next: InstancePhase) -> bool {
        matches!(
            (self, next),
            (InstancePhase::Destroyed, InstancePhase::Running)
                | (InstancePhase::Running, InstancePhase::Destroying)
                | (InstancePhase::Destroying, InstancePhase::Destroyed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstancePhase::Destroyed => "destroyed",
            InstancePhase::Running => "running",
            InstancePhase::Destroying => "destroying",
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of an instance, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub tenant_key: String,
    pub group_name: String,
    pub phase: InstancePhase,
    pub expires_at: Option<DateTime<Utc>>,
    pub endpoint: Option<Endpoint>,
}

impl InstanceSnapshot {
    /// `host:port` while running.
    pub fn connection_string(&self) -> Option<String> {
        match self.phase {
            InstancePhase::Running => self.endpoint.as_ref().map(Endpoint::to_string),
            _ => None,
        }
    }

    /// Expiration as `YYYY-MM-DD HH:MM:SS UTC`, or `<unknown>`.
    pub fn expiration_display(&self) -> String {
        format_expiration(self.expires_at)
    }

    /// Running with an expiration at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.phase == InstancePhase::Running && self.expires_at.is_some_and(|at| at <= now)
    }
}

pub(crate) fn format_expiration(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => UNKNOWN_EXPIRATION.to_string(),
    }
}

#[derive(Debug)]
struct InstanceRecord {
    phase: InstancePhase,
    expires_at: Option<DateTime<Utc>>,
    endpoint: Option<Endpoint>,
}

/// A team's deployment. Never removed once registered; a destroyed
/// instance can be deployed again.
#[derive(Debug)]
pub struct DeploymentInstance {
    tenant_key: String,
    group_name: String,
    record: Mutex<InstanceRecord>,
    published: watch::Sender<InstanceSnapshot>,
}

impl DeploymentInstance {
    /// A fresh, destroyed instance.
    pub fn new(tenant_key: &str, group_name: &str) -> Self {
        Self::with_record(
            tenant_key,
            group_name,
            InstanceRecord {
                phase: InstancePhase::Destroyed,
                expires_at: None,
                endpoint: None,
            },
        )
    }

    /// A running instance rebuilt from resources found on the backend.
    pub fn recovered(
        tenant_key: &str,
        group_name: &str,
        expires_at: DateTime<Utc>,
        endpoint: Endpoint,
    ) -> Self {
        Self::with_record(
            tenant_key,
            group_name,
            InstanceRecord {
                phase: InstancePhase::Running,
                expires_at: Some(expires_at),
                endpoint: Some(endpoint),
            },
        )
    }

    fn with_record(tenant_key: &str, group_name: &str, record: InstanceRecord) -> Self {
        let snapshot = InstanceSnapshot {
            tenant_key: tenant_key.to_string(),
            group_name: group_name.to_string(),
            phase: record.phase,
            expires_at: record.expires_at,
            endpoint: record.endpoint.clone(),
        };
        let (published, _) = watch::channel(snapshot);
        Self {
            tenant_key: tenant_key.to_string(),
            group_name: group_name.to_string(),
            record: Mutex::new(record),
            published,
        }
    }

    pub fn tenant_key(&self) -> &str {
        &self.tenant_key
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Latest committed state. Never blocks.
    pub fn snapshot(&self) -> InstanceSnapshot {
        self.published.borrow().clone()
    }

    /// Receive every committed change from now on.
    pub fn subscribe(&self) -> watch::Receiver<InstanceSnapshot> {
        self.published.subscribe()
    }

    /// Take the instance lock, waiting for any operation in flight.
    pub async fn lock(&self) -> InstanceGuard<'_> {
        InstanceGuard {
            instance: self,
            record: self.record.lock().await,
        }
    }

    /// Take the instance lock only if no operation is in flight.
    pub fn try_lock(&self) -> Option<InstanceGuard<'_>> {
        let record = self.record.try_lock().ok()?;
        Some(InstanceGuard {
            instance: self,
            record,
        })
    }
}

/// Exclusive access to one instance. Released on drop, on every path.
pub struct InstanceGuard<'a> {
    instance: &'a DeploymentInstance,
    record: MutexGuard<'a, InstanceRecord>,
}

impl InstanceGuard<'_> {
    pub fn tenant_key(&self) -> &str {
        &self.instance.tenant_key
    }

    pub fn group_name(&self) -> &str {
        &self.instance.group_name
    }

    pub fn phase(&self) -> InstancePhase {
        self.record.phase
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.record.expires_at
    }

    pub fn expiration_display(&self) -> String {
        format_expiration(self.record.expires_at)
    }

    /// `host:port` of the current endpoint, with the unknown sentinel
    /// when none is recorded.
    pub fn connection_string(&self) -> String {
        self.record
            .endpoint
            .clone()
            .unwrap_or_else(Endpoint::unknown)
            .to_string()
    }

    /// Running with an expiration at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.record.phase == InstancePhase::Running
            && self.record.expires_at.is_some_and(|at| at <= now)
    }

    /// `Destroyed → Running`.
    pub fn mark_running(
        &mut self,
        expires_at: DateTime<Utc>,
        endpoint: Endpoint,
    ) -> LifecycleResult<()> {
        self.transition(InstancePhase::Running)?;
        self.record.expires_at = Some(expires_at);
        self.record.endpoint = Some(endpoint);
        self.publish();
        Ok(())
    }

    /// `Running → Destroying`. Expiration and endpoint are kept until the
    /// backend confirms the deletion.
    pub fn mark_destroying(&mut self) -> LifecycleResult<()> {
        self.transition(InstancePhase::Destroying)?;
        self.publish();
        Ok(())
    }

    /// `Destroying → Destroyed`, clearing expiration and endpoint.
    pub fn mark_destroyed(&mut self) -> LifecycleResult<()> {
        self.transition(InstancePhase::Destroyed)?;
        self.record.expires_at = None;
        self.record.endpoint = None;
        self.publish();
        Ok(())
    }

    /// Move the expiration of a running instance.
    pub fn set_expiration(&mut self, expires_at: DateTime<Utc>) -> LifecycleResult<()> {
        if self.record.phase != InstancePhase::Running {
            return Err(LifecycleError::NotRunning {
                tenant: self.instance.tenant_key.clone(),
                phase: self.record.phase,
            });
        }
        self.record.expires_at = Some(expires_at);
        self.publish();
        Ok(())
    }

    fn transition(&mut self, next: InstancePhase) -> LifecycleResult<()> {
        let from = self.record.phase;
        if !from.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition { from, to: next });
        }
        debug!(tenant = %self.instance.tenant_key, %from, to = %next, "instance transition");
        self.record.phase = next;
        Ok(())
    }

    fn publish(&self) {
        self.instance.published.send_replace(InstanceSnapshot {
            tenant_key: self.instance.tenant_key.clone(),
            group_name: self.instance.group_name.clone(),
            phase: self.record.phase,
            expires_at: self.record.expires_at,
            endpoint: self.record.endpoint.clone(),
        });
    }
}
