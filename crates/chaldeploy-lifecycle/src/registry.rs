//! Instance registry — team id → shared [`DeploymentInstance`].
//!
//! The registry lock only covers inserting a new team. Everything after
//! that is guarded by the instance's own lock, so teams never contend.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::instance::DeploymentInstance;

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Arc<DeploymentInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the team's instance, inserting the one built by `make` if the
    /// team is new. The flag is true for exactly one caller per team.
    pub async fn get_or_create<F>(&self, tenant_key: &str, make: F) -> (Arc<DeploymentInstance>, bool)
    where
        F: FnOnce() -> DeploymentInstance,
    {
        if let Some(existing) = self.instances.read().await.get(tenant_key) {
            return (existing.clone(), false);
        }

        match self.instances.write().await.entry(tenant_key.to_string()) {
            Entry::Occupied(slot) => (slot.get().clone(), false),
            Entry::Vacant(slot) => (slot.insert(Arc::new(make())).clone(), true),
        }
    }

    pub async fn get(&self, tenant_key: &str) -> Option<Arc<DeploymentInstance>> {
        self.instances.read().await.get(tenant_key).cloned()
    }

    /// Register an instance found on the backend. An already registered
    /// team is left alone and `false` is returned.
    pub async fn insert_recovered(&self, instance: DeploymentInstance) -> bool {
        match self.instances.write().await.entry(instance.tenant_key().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(instance));
                true
            }
        }
    }

    /// Visit every instance registered at the time of the call.
    ///
    /// The visitor runs without the registry lock held, so it may lock
    /// instances; teams inserted meanwhile are not visited.
    pub async fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<DeploymentInstance>),
    {
        for instance in self.instances().await {
            visit(&instance);
        }
    }

    /// Handles to every registered instance.
    pub async fn instances(&self) -> Vec<Arc<DeploymentInstance>> {
        self.instances.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstancePhase;
    use chaldeploy_orchestrator::Endpoint;
    use chrono::Utc;

    #[tokio::test]
    async fn first_insert_wins() {
        let registry = InstanceRegistry::new();
        let (a, new_a) = registry
            .get_or_create("team-1", || DeploymentInstance::new("team-1", "g1"))
            .await;
        let (b, new_b) = registry
            .get_or_create("team-1", || panic!("must not build a second instance"))
            .await;
        assert!(new_a);
        assert!(!new_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.instances().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_instance() {
        let registry = Arc::new(InstanceRegistry::new());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .get_or_create("team-1", || DeploymentInstance::new("team-1", "g1"))
                        .await
                })
            })
            .collect();

        let mut created = 0;
        let mut first: Option<Arc<DeploymentInstance>> = None;
        for handle in handles {
            let (instance, was_new) = handle.await.unwrap();
            if was_new {
                created += 1;
            }
            match &first {
                Some(f) => assert!(Arc::ptr_eq(f, &instance)),
                None => first = Some(instance),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn recovered_does_not_replace_existing() {
        let registry = InstanceRegistry::new();
        registry
            .get_or_create("team-1", || DeploymentInstance::new("team-1", "g1"))
            .await;
        let inserted = registry
            .insert_recovered(DeploymentInstance::recovered(
                "team-1",
                "g1",
                Utc::now(),
                Endpoint::unknown(),
            ))
            .await;
        assert!(!inserted);
        let instance = registry.get("team-1").await.unwrap();
        assert_eq!(instance.snapshot().phase, InstancePhase::Destroyed);
    }

    #[tokio::test]
    async fn visit_while_instance_locked() {
        let registry = InstanceRegistry::new();
        let (instance, _) = registry
            .get_or_create("team-1", || DeploymentInstance::new("team-1", "g1"))
            .await;
        registry
            .insert_recovered(DeploymentInstance::recovered(
                "team-2",
                "g2",
                Utc::now(),
                Endpoint::unknown(),
            ))
            .await;

        let _guard = instance.lock().await;
        let mut running = Vec::new();
        registry
            .for_each(|i| {
                let snapshot = i.snapshot();
                if snapshot.phase == InstancePhase::Running {
                    running.push(snapshot);
                }
            })
            .await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].tenant_key, "team-2");
        assert!(registry.get("team-3").await.is_none());
    }
}
