//! Entity graph integration tests
//!
//! Ancestor closures over diamonds, cycles and deep chains, plus a property
//! test comparing the closure against a reference reachability walk.

use async_trait::async_trait;
use ipermit_authz::{AuthzError, Entity, EntityGraph, EntityId, EntityStore, InMemoryStore, PermitEngine, Result};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Entity store that counts fetches per id
#[derive(Default)]
struct CountingStore {
    inner: InMemoryStore,
    fetches: Mutex<HashMap<EntityId, usize>>,
}

impl CountingStore {
    fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }

    fn max_fetches_per_node(&self) -> usize {
        self.fetches.lock().values().copied().max().unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for CountingStore {
    async fn retrieve_entity(&self, id: EntityId) -> Result<Entity> {
        *self.fetches.lock().entry(id).or_insert(0) += 1;
        self.inner.retrieve_entity(id).await
    }

    async fn create_entity(&self, parents: HashSet<EntityId>) -> Result<Entity> {
        self.inner.create_entity(parents).await
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        self.inner.upsert_entity(entity).await
    }

    async fn add_parent_edge(&self, id: EntityId, parent: EntityId) -> Result<()> {
        self.inner.add_parent_edge(id, parent).await
    }
}

async fn create(store: &dyn EntityStore, parents: &[EntityId]) -> EntityId {
    store.create_entity(parents.iter().copied().collect()).await.unwrap().id
}

// ============================================================================
// CLOSURE SHAPES
// ============================================================================

#[tokio::test]
async fn test_diamond_visits_each_node_once() {
    let store = Arc::new(CountingStore::default());
    let root = create(store.as_ref(), &[]).await;
    let b = create(store.as_ref(), &[root]).await;
    let c = create(store.as_ref(), &[root]).await;
    let a = create(store.as_ref(), &[b, c]).await;

    let graph = EntityGraph::new(store.clone());
    let ancestors = graph.ascertain_ancestors(a, false).await.unwrap();

    assert_eq!(ancestors, HashSet::from([b, c, root]));
    // a itself plus b, c and root, each exactly once
    assert_eq!(store.total_fetches(), 4);
    assert_eq!(store.max_fetches_per_node(), 1);
}

#[tokio::test]
async fn test_two_parents_without_shared_ancestor() {
    let store = Arc::new(InMemoryStore::new());
    let b = create(store.as_ref(), &[]).await;
    let c = create(store.as_ref(), &[]).await;
    let a = create(store.as_ref(), &[b]).await;

    let engine = PermitEngine::new(store);
    assert_eq!(engine.ascertain_ancestors(a, false).await.unwrap(), HashSet::from([b]));

    engine.add_parent(a, c).await.unwrap();
    assert_eq!(engine.ascertain_ancestors(a, false).await.unwrap(), HashSet::from([b, c]));
}

#[tokio::test]
async fn test_add_parent_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let engine = PermitEngine::new(store);
    let parent = engine.create_entity(HashSet::new()).await.unwrap();
    let child = engine.create_entity(HashSet::new()).await.unwrap();

    engine.add_parent(child.id, parent.id).await.unwrap();
    let once = engine.ascertain_ancestors(child.id, false).await.unwrap();

    engine.add_parent(child.id, parent.id).await.unwrap();
    let twice = engine.ascertain_ancestors(child.id, false).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(engine.retrieve_entity(child.id).await.unwrap().parents.len(), 1);
}

#[tokio::test]
async fn test_add_parent_to_missing_entity() {
    let engine = PermitEngine::new(Arc::new(InMemoryStore::new()));
    let err = engine.add_parent(EntityId::new(), EntityId::new()).await.unwrap_err();
    assert!(matches!(err, AuthzError::NotFound { kind: "entity", .. }));
}

#[tokio::test]
async fn test_self_only_through_cycle_or_flag() {
    let store = Arc::new(InMemoryStore::new());
    let b = create(store.as_ref(), &[]).await;
    let a = create(store.as_ref(), &[b]).await;
    let graph = EntityGraph::new(store.clone());

    assert!(!graph.ascertain_ancestors(a, false).await.unwrap().contains(&a));
    assert!(graph.ascertain_ancestors(a, true).await.unwrap().contains(&a));

    store.add_parent_edge(b, a).await.unwrap();
    assert_eq!(graph.ascertain_ancestors(a, false).await.unwrap(), HashSet::from([a, b]));
}

#[tokio::test]
async fn test_cycle_fetches_each_node_once() {
    let store = Arc::new(CountingStore::default());
    let a = create(store.as_ref(), &[]).await;
    let b = create(store.as_ref(), &[a]).await;
    let c = create(store.as_ref(), &[b]).await;
    store.add_parent_edge(a, c).await.unwrap();

    let graph = EntityGraph::new(store.clone());
    let ancestors = graph.ascertain_ancestors(a, false).await.unwrap();

    assert_eq!(ancestors, HashSet::from([a, b, c]));
    assert_eq!(store.max_fetches_per_node(), 1);
}

#[tokio::test]
async fn test_deep_chain() {
    let store = Arc::new(InMemoryStore::new());
    let mut previous = create(store.as_ref(), &[]).await;
    let top = previous;
    for _ in 0..5_000 {
        previous = create(store.as_ref(), &[previous]).await;
    }

    let graph = EntityGraph::new(store);
    let ancestors = graph.ascertain_ancestors(previous, false).await.unwrap();

    assert_eq!(ancestors.len(), 5_000);
    assert!(ancestors.contains(&top));
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

fn reachable(parents: &HashMap<EntityId, Vec<EntityId>>, start: EntityId) -> HashSet<EntityId> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<EntityId> = parents[&start].iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        if seen.insert(node) {
            queue.extend(parents[&node].iter().copied());
        }
    }
    seen
}

proptest! {
    #[test]
    fn test_closure_matches_reachability(
        edges in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..24)
    ) {
        tokio_test::block_on(async {
            let ids: Vec<EntityId> = (0..edges.len()).map(|_| EntityId::new()).collect();

            // Parents always have a lower index, so the graph is a DAG
            let mut parents: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
            for (i, picks) in edges.iter().enumerate() {
                let chosen = if i == 0 {
                    Vec::new()
                } else {
                    picks.iter().map(|p| ids[p.index(i)]).collect()
                };
                parents.insert(ids[i], chosen);
            }

            for &target in &ids {
                let store = Arc::new(CountingStore::default());
                for (&id, ps) in &parents {
                    store.upsert_entity(Entity::with_parents(id, ps.iter().copied())).await.unwrap();
                }

                let graph = EntityGraph::new(store.clone());
                let expected = reachable(&parents, target);
                let actual = graph.ascertain_ancestors(target, false).await.unwrap();

                assert_eq!(&actual, &expected);
                assert_eq!(store.total_fetches(), expected.len() + 1);
                assert!(store.max_fetches_per_node() <= 1);

                let with_self = graph.ascertain_ancestors(target, true).await.unwrap();
                assert_eq!(with_self.len(), expected.len() + 1);
            }
        });
    }
}
