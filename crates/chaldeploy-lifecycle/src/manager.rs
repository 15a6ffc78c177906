//! Instance lifecycle manager — create / extend / destroy / sweep.
//!
//! Each operation resolves the team's [`DeploymentInstance`] through the
//! registry, takes its lock, drives the [`OrchestrationDriver`] and
//! commits the resulting transition before releasing the lock. Operations
//! for one team are therefore totally ordered; different teams proceed in
//! parallel.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use chaldeploy_core::ChallengeIdentity;
use chaldeploy_orchestrator::{OrchestrationDriver, Teardown};

use crate::error::{LifecycleError, LifecycleResult};
use crate::instance::{DeploymentInstance, InstanceGuard, InstancePhase, InstanceSnapshot};
use crate::registry::InstanceRegistry;

pub struct InstanceManager {
    driver: OrchestrationDriver,
    registry: InstanceRegistry,
    runtime: TimeDelta,
}

impl InstanceManager {
    /// `runtime` is both the lifetime of a new instance and the step an
    /// extension adds.
    pub fn new(driver: OrchestrationDriver, runtime: TimeDelta) -> Self {
        Self {
            driver,
            registry: InstanceRegistry::new(),
            runtime,
        }
    }

    pub fn identity(&self) -> &ChallengeIdentity {
        self.driver.template().identity()
    }

    /// `from + runtime`, or an error when that leaves chrono's range.
    fn expiry_after(&self, tenant_key: &str, from: DateTime<Utc>) -> LifecycleResult<DateTime<Utc>> {
        from.checked_add_signed(self.runtime)
            .ok_or_else(|| LifecycleError::ExpirationOverflow(tenant_key.to_string()))
    }

    /// Rebuild the registry from the challenge's resource groups on the
    /// backend. Returns how many instances were recovered.
    pub async fn recover(&self) -> LifecycleResult<usize> {
        let now = Utc::now();
        let fallback = now.checked_add_signed(self.runtime).unwrap_or(now);
        let discovered = self.driver.discover(fallback).await?;

        let mut recovered = 0;
        for found in discovered {
            let instance = DeploymentInstance::recovered(
                &found.tenant_key,
                &found.group_name,
                found.expires_at,
                found.endpoint,
            );
            if self.registry.insert_recovered(instance).await {
                debug!(tenant = %found.tenant_key, group = %found.group_name, "recovered running instance");
                recovered += 1;
            } else {
                warn!(tenant = %found.tenant_key, group = %found.group_name, "team already registered, ignoring duplicate resource group");
            }
        }

        info!(recovered, challenge = %self.identity().name(), "startup reconciliation complete");
        Ok(recovered)
    }

    /// Deploy the team's instance and return its `host:port`.
    ///
    /// A running instance is returned as is. While a destroy for the team
    /// is in flight this waits for it and then deploys afresh.
    pub async fn create_instance(&self, tenant_key: &str) -> LifecycleResult<String> {
        self.identity()
            .validate_tenant_key(tenant_key)
            .map_err(|reason| LifecycleError::InvalidTenant {
                tenant: tenant_key.to_string(),
                reason,
            })?;

        let group = self.identity().group_name(tenant_key);
        let (instance, registered) = self
            .registry
            .get_or_create(tenant_key, || DeploymentInstance::new(tenant_key, &group))
            .await;
        if registered {
            debug!(tenant = %tenant_key, %group, "registered new team");
        }

        let mut guard = instance.lock().await;
        match guard.phase() {
            InstancePhase::Running => {
                debug!(tenant = %tenant_key, "instance already running");
                return Ok(guard.connection_string());
            }
            InstancePhase::Destroying => {
                return Err(LifecycleError::TearingDown(tenant_key.to_string()));
            }
            InstancePhase::Destroyed => {}
        }

        let expires_at = self.expiry_after(tenant_key, Utc::now())?;
        let endpoint = match self.driver.provision(&group, tenant_key, expires_at).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(tenant = %tenant_key, %group, error = %e, "failed to create instance");
                return Err(e.into());
            }
        };

        let connection = endpoint.to_string();
        guard.mark_running(expires_at, endpoint)?;
        info!(tenant = %tenant_key, %group, %connection, expires_at = %guard.expiration_display(), "instance created");
        Ok(connection)
    }

    /// Latest state of the team's instance, without waiting on its lock.
    pub async fn get_instance(&self, tenant_key: &str) -> Option<InstanceSnapshot> {
        self.registry.get(tenant_key).await.map(|i| i.snapshot())
    }

    /// Follow the team's instance as it changes.
    pub async fn subscribe(&self, tenant_key: &str) -> Option<watch::Receiver<InstanceSnapshot>> {
        self.registry.get(tenant_key).await.map(|i| i.subscribe())
    }

    /// Push the team's expiration back by one runtime and return the new
    /// expiration for display. Only unexpired running instances qualify.
    pub async fn extend_instance(&self, tenant_key: &str) -> LifecycleResult<String> {
        let instance = self.instance(tenant_key).await?;
        let mut guard = instance.lock().await;

        if guard.phase() != InstancePhase::Running {
            return Err(LifecycleError::NotRunning {
                tenant: tenant_key.to_string(),
                phase: guard.phase(),
            });
        }
        let current = match guard.expires_at() {
            Some(at) if at > Utc::now() => at,
            _ => return Err(LifecycleError::Expired(tenant_key.to_string())),
        };

        let extended = self.expiry_after(tenant_key, current)?;
        if let Err(e) = self.driver.update_expiration(guard.group_name(), extended).await {
            error!(tenant = %tenant_key, error = %e, "failed to extend instance");
            return Err(e.into());
        }
        guard.set_expiration(extended)?;

        let new_expiry = guard.expiration_display();
        info!(tenant = %tenant_key, expires_at = %new_expiry, "instance extended");
        Ok(new_expiry)
    }

    /// Tear down the team's instance. A no-op unless it is running.
    pub async fn destroy_instance(&self, tenant_key: &str) -> LifecycleResult<()> {
        let instance = self.instance(tenant_key).await?;
        let mut guard = instance.lock().await;

        if guard.phase() != InstancePhase::Running {
            debug!(tenant = %tenant_key, phase = %guard.phase(), "nothing to destroy");
            return Ok(());
        }
        self.tear_down(&mut guard).await
    }

    /// One pass over the registry destroying every expired running
    /// instance. Stops at the first failure and returns it; the remaining
    /// instances wait for the next pass.
    pub async fn sweep_expired(&self) -> LifecycleResult<usize> {
        let now = Utc::now();
        let mut expired = Vec::new();
        self.registry
            .for_each(|instance| {
                if instance.snapshot().is_expired_at(now) {
                    expired.push(instance.clone());
                }
            })
            .await;

        let mut destroyed = 0;
        for instance in expired {
            let mut guard = instance.lock().await;
            // May have been extended or destroyed since the scan.
            if !guard.is_expired_at(Utc::now()) {
                continue;
            }
            info!(tenant = %guard.tenant_key(), expired_at = %guard.expiration_display(), "destroying expired instance");
            if let Err(e) = self.tear_down(&mut guard).await {
                error!(tenant = %guard.tenant_key(), error = %e, "expiration sweep aborted");
                return Err(e);
            }
            destroyed += 1;
        }

        if destroyed > 0 {
            info!(destroyed, "expiration sweep complete");
        } else {
            debug!("expiration sweep found nothing to destroy");
        }
        Ok(destroyed)
    }

    /// Retry the teardown of every instance left `Destroying` by a failed
    /// destroy. Instances with an operation in flight are skipped. Returns
    /// how many reached `Destroyed`.
    pub async fn reconcile_stuck(&self) -> usize {
        let mut stuck = Vec::new();
        self.registry
            .for_each(|instance| {
                if instance.snapshot().phase == InstancePhase::Destroying {
                    stuck.push(instance.clone());
                }
            })
            .await;

        let mut resolved = 0;
        for instance in stuck {
            let Some(mut guard) = instance.try_lock() else {
                continue;
            };
            if guard.phase() != InstancePhase::Destroying {
                continue;
            }
            warn!(tenant = %guard.tenant_key(), group = %guard.group_name(), "retrying stuck teardown");
            match self.finish_teardown(&mut guard).await {
                Ok(()) => resolved += 1,
                Err(e) => warn!(tenant = %guard.tenant_key(), error = %e, "instance still stuck destroying"),
            }
        }
        resolved
    }

    async fn instance(&self, tenant_key: &str) -> LifecycleResult<Arc<DeploymentInstance>> {
        self.registry
            .get(tenant_key)
            .await
            .ok_or_else(|| LifecycleError::UnknownTenant(tenant_key.to_string()))
    }

    /// `Running → Destroying → Destroyed`. The `Destroying` phase is
    /// published before any backend call.
    async fn tear_down(&self, guard: &mut InstanceGuard<'_>) -> LifecycleResult<()> {
        guard.mark_destroying()?;
        if let Err(e) = self.finish_teardown(guard).await {
            error!(tenant = %guard.tenant_key(), group = %guard.group_name(), error = %e, "failed to destroy instance, left destroying");
            return Err(e);
        }
        Ok(())
    }

    async fn finish_teardown(&self, guard: &mut InstanceGuard<'_>) -> LifecycleResult<()> {
        let outcome = self.driver.teardown(guard.group_name()).await?;
        guard.mark_destroyed()?;
        match outcome {
            Teardown::AlreadyAbsent => {
                info!(tenant = %guard.tenant_key(), "resource group already gone, instance destroyed")
            }
            Teardown::Deleted => info!(tenant = %guard.tenant_key(), "instance destroyed"),
        }
        Ok(())
    }
}
