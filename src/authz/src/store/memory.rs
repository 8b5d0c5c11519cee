//! In-memory store implementation

use super::{EntityStore, PolicyStore, ResourceStore};
use crate::error::{AuthzError, Result};
use crate::policy::Policy;
use crate::relevance::PolicyFilter;
use crate::types::{Entity, EntityId, PolicyId, Resource, ResourceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Serializable dump of a store's contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Entities
    pub entities: Vec<Entity>,
    /// Resources
    pub resources: Vec<Resource>,
    /// Policies, in retrieval order
    pub policies: Vec<Policy>,
}

impl Snapshot {
    /// Read a snapshot from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Process-local store
///
/// Policies keep insertion order, which is the tie-break among equal priorities.
pub struct InMemoryStore {
    entities: Arc<RwLock<HashMap<EntityId, Entity>>>,
    resources: Arc<RwLock<HashMap<ResourceId, Resource>>>,
    policies: Arc<RwLock<Vec<Policy>>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default())
    }

    /// Create a store pre-populated from a snapshot
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let entities = snapshot.entities.into_iter().map(|e| (e.id, e)).collect();
        let resources = snapshot.resources.into_iter().map(|r| (r.id, r)).collect();

        let mut policies: Vec<Policy> = Vec::with_capacity(snapshot.policies.len());
        for policy in snapshot.policies {
            match policies.iter_mut().find(|p| p.id == policy.id) {
                Some(existing) => *existing = policy,
                None => policies.push(policy),
            }
        }

        Self {
            entities: Arc::new(RwLock::new(entities)),
            resources: Arc::new(RwLock::new(resources)),
            policies: Arc::new(RwLock::new(policies)),
        }
    }

    /// Dump the current contents
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            entities: self.entities.read().await.values().cloned().collect(),
            resources: self.resources.read().await.values().cloned().collect(),
            policies: self.policies.read().await.clone(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn retrieve_entity(&self, id: EntityId) -> Result<Entity> {
        let entities = self.entities.read().await;
        entities
            .get(&id)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("entity", id))
    }

    async fn create_entity(&self, parents: HashSet<EntityId>) -> Result<Entity> {
        let entity = Entity::with_parents(EntityId::new(), parents);
        let mut entities = self.entities.write().await;
        entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        let mut entities = self.entities.write().await;
        entities.insert(entity.id, entity);
        Ok(())
    }

    async fn add_parent_edge(&self, id: EntityId, parent: EntityId) -> Result<()> {
        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| AuthzError::not_found("entity", id))?;
        entity.add_parent(parent);
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn retrieve_resource(&self, id: ResourceId) -> Result<Resource> {
        let resources = self.resources.read().await;
        resources
            .get(&id)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("resource", id))
    }

    async fn upsert_resource(&self, resource: Resource) -> Result<()> {
        let mut resources = self.resources.write().await;
        resources.insert(resource.id, resource);
        Ok(())
    }

    async fn delete_resource(&self, id: ResourceId) -> Result<()> {
        let mut resources = self.resources.write().await;
        resources.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for InMemoryStore {
    async fn retrieve_policy(&self, id: PolicyId) -> Result<Policy> {
        let policies = self.policies.read().await;
        policies
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("policy", id))
    }

    async fn upsert_policy(&self, policy: Policy) -> Result<()> {
        let mut policies = self.policies.write().await;
        match policies.iter_mut().find(|p| p.id == policy.id) {
            Some(existing) => *existing = policy,
            None => policies.push(policy),
        }
        Ok(())
    }

    async fn delete_policy(&self, id: PolicyId) -> Result<()> {
        let mut policies = self.policies.write().await;
        policies.retain(|p| p.id != id);
        Ok(())
    }

    async fn find_policies(&self, filter: &PolicyFilter) -> Result<Vec<Policy>> {
        let policies = self.policies.read().await;
        let mut matching: Vec<Policy> = policies
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();

        // Stable: equal priorities keep insertion order
        matching.sort_by_key(|p| Reverse(p.priority));

        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySelector;

    #[tokio::test]
    async fn test_entity_lifecycle() {
        let store = InMemoryStore::new();
        let parent = store.create_entity(HashSet::new()).await.unwrap();
        let child = store.create_entity(HashSet::new()).await.unwrap();

        store.add_parent_edge(child.id, parent.id).await.unwrap();
        store.add_parent_edge(child.id, parent.id).await.unwrap();

        let loaded = store.retrieve_entity(child.id).await.unwrap();
        assert_eq!(loaded.parents.len(), 1);
        assert!(loaded.parents.contains(&parent.id));
    }

    #[tokio::test]
    async fn test_missing_documents_are_not_found() {
        let store = InMemoryStore::new();

        let err = store.retrieve_entity(EntityId::new()).await.unwrap_err();
        assert!(matches!(err, AuthzError::NotFound { kind: "entity", .. }));

        let err = store.add_parent_edge(EntityId::new(), EntityId::new()).await.unwrap_err();
        assert!(matches!(err, AuthzError::NotFound { kind: "entity", .. }));

        let err = store.retrieve_resource(ResourceId::new()).await.unwrap_err();
        assert!(matches!(err, AuthzError::NotFound { kind: "resource", .. }));

        let err = store.retrieve_policy(PolicyId::new()).await.unwrap_err();
        assert!(matches!(err, AuthzError::NotFound { kind: "policy", .. }));
    }

    #[tokio::test]
    async fn test_find_policies_priority_then_insertion_order() {
        let store = InMemoryStore::new();
        let low = Policy::new().with_selector(PolicySelector::Wildcard).with_priority(-5);
        let first = Policy::new().with_selector(PolicySelector::Wildcard);
        let high = Policy::new().with_selector(PolicySelector::Wildcard).with_priority(10);
        let second = Policy::new().with_selector(PolicySelector::Wildcard);

        for policy in [&low, &first, &high, &second] {
            store.upsert_policy(policy.clone()).await.unwrap();
        }

        let filter = PolicyFilter::new(&Resource::new(), HashSet::new());
        let ids: Vec<PolicyId> = store
            .find_policies(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();

        assert_eq!(ids, vec![high.id, first.id, second.id, low.id]);
    }

    #[tokio::test]
    async fn test_upsert_policy_replaces_in_place() {
        let store = InMemoryStore::new();
        let a = Policy::new().with_selector(PolicySelector::Wildcard);
        let b = Policy::new().with_selector(PolicySelector::Wildcard);
        store.upsert_policy(a.clone()).await.unwrap();
        store.upsert_policy(b.clone()).await.unwrap();
        store.upsert_policy(a.clone().with_priority(0)).await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.policies.len(), 2);
        assert_eq!(snapshot.policies[0].id, a.id);

        store.delete_policy(a.id).await.unwrap();
        assert!(store.retrieve_policy(a.id).await.is_err());
    }
}
