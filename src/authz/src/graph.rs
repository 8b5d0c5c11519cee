//! Entity inheritance graph
//!
//! Entities form a parent graph that is expected to be a DAG but may contain
//! cycles. Ancestor closures are computed with an explicit work-list and a
//! visited set:
//!
//! 1. Seed the result with the start node if `include_self` is requested
//! 2. Queue the start node's direct parents
//! 3. Pop a node; if it is already in the result, skip it
//! 4. Otherwise add it, fetch it, and queue its parents
//!
//! Membership is tested before a node is expanded, so every reachable node is
//! fetched exactly once regardless of diamonds or cycles.

use crate::cache::MemoCache;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::store::EntityStore;
use crate::types::{Entity, EntityId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

type AncestorKey = (EntityId, bool);

/// Ancestor resolver over an [`EntityStore`]
pub struct EntityGraph {
    store: Arc<dyn EntityStore>,
    cache: Option<MemoCache<AncestorKey, Arc<HashSet<EntityId>>>>,
}

impl EntityGraph {
    /// Create a graph without memoization
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store, cache: None }
    }

    /// Create a graph that memoizes closures when `config` enables it
    ///
    /// Cached closures are keyed by entity id and dropped on every
    /// [`add_parent`](Self::add_parent) call made through this graph.
    pub fn with_cache(store: Arc<dyn EntityStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            cache: MemoCache::from_config(config),
        }
    }

    /// Underlying entity store
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Fetch a single entity
    pub async fn retrieve(&self, id: EntityId) -> Result<Entity> {
        self.store.retrieve_entity(id).await
    }

    /// Transitive ancestors of the entity `id`
    ///
    /// Fails with `NotFound` if `id` or any visited ancestor is missing; no
    /// partial result is returned.
    pub async fn ascertain_ancestors(&self, id: EntityId, include_self: bool) -> Result<HashSet<EntityId>> {
        if let Some(hit) = self.cached(id, include_self) {
            return Ok(hit);
        }

        let node = self.retrieve(id).await?;
        self.resolve(&node, include_self).await
    }

    /// Transitive ancestors of an already-loaded entity
    ///
    /// The entity itself is not refetched.
    pub async fn ancestors_of(&self, entity: &Entity, include_self: bool) -> Result<HashSet<EntityId>> {
        if let Some(hit) = self.cached(entity.id, include_self) {
            return Ok(hit);
        }

        self.resolve(entity, include_self).await
    }

    /// Add `parent` to the parents of `target` (idempotent)
    pub async fn add_parent(&self, target: EntityId, parent: EntityId) -> Result<()> {
        self.store.add_parent_edge(target, parent).await?;
        self.invalidate();
        debug!("Added parent edge {} -> {}", target, parent);
        Ok(())
    }

    /// Persist a parent edge and mirror it on the loaded `target`
    pub async fn attach_parent(&self, target: &mut Entity, parent: EntityId) -> Result<()> {
        self.add_parent(target.id, parent).await?;
        target.add_parent(parent);
        Ok(())
    }

    /// Drop every memoized closure
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    fn cached(&self, id: EntityId, include_self: bool) -> Option<HashSet<EntityId>> {
        let hit = self.cache.as_ref()?.get(&(id, include_self))?;
        Some((*hit).clone())
    }

    async fn resolve(&self, root: &Entity, include_self: bool) -> Result<HashSet<EntityId>> {
        let closure = self.walk(root, include_self).await?;

        if let Some(cache) = &self.cache {
            cache.insert((root.id, include_self), Arc::new(closure.clone()));
        }

        Ok(closure)
    }

    async fn walk(&self, root: &Entity, include_self: bool) -> Result<HashSet<EntityId>> {
        let mut visited: HashSet<EntityId> = HashSet::new();
        if include_self {
            visited.insert(root.id);
        }

        let mut pending: VecDeque<EntityId> = root.parents.iter().copied().collect();
        let mut fetches = 0usize;

        while let Some(current) = pending.pop_front() {
            if !visited.insert(current) {
                continue;
            }

            // A cycle back to the start node: its parents are already queued
            if current == root.id {
                continue;
            }

            let node = self.retrieve(current).await?;
            fetches += 1;

            pending.extend(node.parents.into_iter().filter(|p| !visited.contains(p)));
        }

        debug!(
            "Resolved {} ancestors of {} ({} fetches, include_self={})",
            visited.len(),
            root.id,
            fetches,
            include_self
        );

        Ok(visited)
    }
}
