//! Persistence interface for entities, resources and policies
//!
//! The engine only ever talks to these traits. Every operation is atomic per
//! document; nothing here retries, and errors propagate to the caller as-is.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{InMemoryStore, Snapshot};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::error::Result;
use crate::policy::Policy;
use crate::relevance::PolicyFilter;
use crate::types::{Entity, EntityId, PolicyId, Resource, ResourceId};
use async_trait::async_trait;
use std::collections::HashSet;

/// Entity persistence
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch an entity, failing with `NotFound` if absent
    async fn retrieve_entity(&self, id: EntityId) -> Result<Entity>;

    /// Create an entity with a store-assigned id
    async fn create_entity(&self, parents: HashSet<EntityId>) -> Result<Entity>;

    /// Insert or replace an entity
    async fn upsert_entity(&self, entity: Entity) -> Result<()>;

    /// Add `parent` to the parent set of `id` (idempotent)
    async fn add_parent_edge(&self, id: EntityId, parent: EntityId) -> Result<()>;
}

/// Resource persistence
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a resource, failing with `NotFound` if absent
    async fn retrieve_resource(&self, id: ResourceId) -> Result<Resource>;

    /// Insert or replace a resource
    async fn upsert_resource(&self, resource: Resource) -> Result<()>;

    /// Delete a resource (no-op if absent)
    async fn delete_resource(&self, id: ResourceId) -> Result<()>;
}

/// Policy persistence
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch a policy, failing with `NotFound` if absent
    async fn retrieve_policy(&self, id: PolicyId) -> Result<Policy>;

    /// Insert or replace a policy
    async fn upsert_policy(&self, policy: Policy) -> Result<()>;

    /// Delete a policy (no-op if absent)
    async fn delete_policy(&self, id: PolicyId) -> Result<()>;

    /// Policies accepted by `filter`, sorted by priority (descending)
    async fn find_policies(&self, filter: &PolicyFilter) -> Result<Vec<Policy>>;
}
