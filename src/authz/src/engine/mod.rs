//! Permission decision engine
//!
//! Orchestrates relevance filtering, per-policy evaluation and reaction
//! compounding.

pub mod compounder;

pub use compounder::{
    CompoundInput, CompoundStep, Compounder, CompounderKind, DenyOverrides, FirstApplicable, FnCompounder,
    InvocationMode,
};

use crate::check::{CheckCompiler, ConditionTree};
use crate::config::{DataProvider, PermitConfig};
use crate::error::{AuthzError, Result};
use crate::graph::EntityGraph;
use crate::policy::{Policy, Reaction};
use crate::predicate::{CheckPredicate, EntityPredicate};
use crate::registry::{CheckOps, EntityRestrictorOps, OperatorFactory};
use crate::relevance::RelevanceFilter;
use crate::restrictor::Restrictor;
use crate::store::{EntityStore, InMemoryStore, PolicyStore, ResourceStore};
use crate::types::{CheckPermContext, CheckPermRequest, Entity, EntityId, PolicyId, Resource, ResourceId, ResourceRef};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Main permission engine
///
/// # Architecture
///
/// ```text
/// Request → RelevanceFilter → [policies by priority] → Policy::apply_to → Compounder → verdict
///               ↓                                          ↓
///          EntityGraph (owner closure)              CheckCompiler → RestrictorCompiler
/// ```
pub struct PermitEngine {
    /// Resource persistence
    resources: Arc<dyn ResourceStore>,

    /// Policy persistence
    policies: Arc<dyn PolicyStore>,

    /// Entity graph with optional ancestor memoization
    graph: Arc<EntityGraph>,

    /// Condition compiler with optional memoization
    checks: CheckCompiler,

    /// Candidate policy selection
    relevance: RelevanceFilter,

    /// Engine configuration
    config: PermitConfig,
}

impl PermitEngine {
    /// Create an engine over `store` with default configuration and the
    /// process-wide operator registries
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: EntityStore + ResourceStore + PolicyStore + 'static,
    {
        Self::with_config(store, PermitConfig::default())
    }

    /// Create an engine over `store` using the process-wide operator registries
    pub fn with_config<S>(store: Arc<S>, config: PermitConfig) -> Self
    where
        S: EntityStore + ResourceStore + PolicyStore + 'static,
    {
        Self::with_registries(store, config, EntityRestrictorOps::shared(), CheckOps::shared())
    }

    /// Create an engine with explicit operator registries
    ///
    /// # Arguments
    ///
    /// * `store` - Backend implementing all three store traits
    /// * `config` - Engine configuration (only `cache` is used here)
    /// * `restrictor_ops` - Custom restrictor operators
    /// * `check_ops` - Custom condition operators
    pub fn with_registries<S>(
        store: Arc<S>,
        config: PermitConfig,
        restrictor_ops: Arc<EntityRestrictorOps>,
        check_ops: Arc<CheckOps>,
    ) -> Self
    where
        S: EntityStore + ResourceStore + PolicyStore + 'static,
    {
        let entities: Arc<dyn EntityStore> = store.clone();
        let resources: Arc<dyn ResourceStore> = store.clone();
        let policies: Arc<dyn PolicyStore> = store;

        let graph = Arc::new(EntityGraph::with_cache(entities, &config.cache));
        let checks = CheckCompiler::new(Arc::clone(&graph), restrictor_ops, check_ops).with_cache(&config.cache);
        let relevance = RelevanceFilter::new(Arc::clone(&graph), Arc::clone(&policies));

        info!(
            "PermitEngine initialized with cache={}, max_length={}",
            config.cache.enabled, config.cache.max_length
        );

        Self {
            resources,
            policies,
            graph,
            checks,
            relevance,
            config,
        }
    }

    /// Bootstrap the configured store and build an engine over it
    ///
    /// Requesting PostgreSQL without the `postgres` feature fails with `Config`.
    pub async fn from_config(config: PermitConfig) -> Result<Self> {
        match config.data_provider.clone() {
            DataProvider::Memory => Ok(Self::with_config(Arc::new(InMemoryStore::new()), config)),
            #[cfg(feature = "postgres")]
            DataProvider::Postgres { connection_string } => {
                let store = crate::store::PostgresStore::connect(&connection_string, &config.table_prefix).await?;
                store.run_migrations().await?;
                Ok(Self::with_config(Arc::new(store), config))
            }
            #[cfg(not(feature = "postgres"))]
            DataProvider::Postgres { .. } => Err(AuthzError::Config(
                "the postgres data provider requires the `postgres` feature".to_string(),
            )),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &PermitConfig {
        &self.config
    }

    /// Entity graph
    pub fn graph(&self) -> &Arc<EntityGraph> {
        &self.graph
    }

    /// Condition compiler
    pub fn checks(&self) -> &CheckCompiler {
        &self.checks
    }

    // ---- Entities ----

    /// Transitive ancestors of `id`
    pub async fn ascertain_ancestors(&self, id: EntityId, include_self: bool) -> Result<HashSet<EntityId>> {
        self.graph.ascertain_ancestors(id, include_self).await
    }

    /// Make `parent` a parent of `target` (idempotent)
    pub async fn add_parent(&self, target: EntityId, parent: EntityId) -> Result<()> {
        self.graph.add_parent(target, parent).await
    }

    /// Create an entity with a fresh id
    pub async fn create_entity(&self, parents: HashSet<EntityId>) -> Result<Entity> {
        let entity = self.graph.store().create_entity(parents).await?;
        debug!("Created entity {} with {} parents", entity.id, entity.parents.len());
        Ok(entity)
    }

    /// Fetch an entity
    pub async fn retrieve_entity(&self, id: EntityId) -> Result<Entity> {
        self.graph.retrieve(id).await
    }

    /// Insert or replace an entity
    pub async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        self.graph.store().upsert_entity(entity).await?;
        self.graph.invalidate();
        Ok(())
    }

    // ---- Compilers ----

    /// Compile a restrictor into an entity predicate
    pub fn compile_entity_restrictor(&self, restrictor: &Restrictor) -> Result<EntityPredicate> {
        self.checks.restrictors().compile(restrictor)
    }

    /// Register custom restrictor operators
    pub fn add_custom_entity_restrictor_ops<I>(&self, ops: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, OperatorFactory<EntityPredicate>)>,
    {
        self.checks.restrictors().ops().extend(ops)?;
        self.checks.invalidate_cache();
        Ok(())
    }

    /// Compile a condition tree into a context predicate
    pub fn compile_check(&self, tree: &ConditionTree) -> Result<CheckPredicate> {
        self.checks.compile(tree)
    }

    /// Register custom condition operators
    pub fn add_custom_check_ops<I>(&self, ops: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, OperatorFactory<CheckPredicate>)>,
    {
        self.checks.ops().extend(ops)?;
        self.checks.invalidate_cache();
        Ok(())
    }

    // ---- Policies and resources ----

    /// Candidate policies for `resource`, highest priority first
    pub async fn retrieve_relevant_policies(&self, resource: &Resource) -> Result<Vec<Policy>> {
        self.relevance.retrieve_relevant_policies(resource).await
    }

    /// Fetch a policy
    pub async fn retrieve_policy(&self, id: PolicyId) -> Result<Policy> {
        self.policies.retrieve_policy(id).await
    }

    /// Insert or replace a policy
    pub async fn upsert_policy(&self, policy: Policy) -> Result<()> {
        debug!("Upserting policy {} (priority={})", policy.id, policy.priority);
        self.policies.upsert_policy(policy).await?;
        self.checks.invalidate_cache();
        Ok(())
    }

    /// Delete a policy
    pub async fn delete_policy(&self, id: PolicyId) -> Result<()> {
        self.policies.delete_policy(id).await?;
        self.checks.invalidate_cache();
        Ok(())
    }

    /// Fetch a resource
    pub async fn retrieve_resource(&self, id: ResourceId) -> Result<Resource> {
        self.resources.retrieve_resource(id).await
    }

    /// Insert or replace a resource
    pub async fn upsert_resource(&self, resource: Resource) -> Result<()> {
        self.resources.upsert_resource(resource).await
    }

    /// Delete a resource
    pub async fn delete_resource(&self, id: ResourceId) -> Result<()> {
        self.resources.delete_resource(id).await
    }

    // ---- Decisions ----

    /// Decide a request with the default [`DenyOverrides`] compounder
    pub async fn check_perm(&self, request: CheckPermRequest) -> Result<bool> {
        self.check_perm_with(request, &DenyOverrides).await
    }

    /// Decide a request with a custom compounder
    ///
    /// # Pipeline
    ///
    /// 1. Resolve the resource if only its id was given
    /// 2. Fetch relevant policies, highest priority first
    /// 3. Apply each policy to the request context
    /// 4. Feed reactions to the compounder per its invocation mode
    ///
    /// # Errors
    ///
    /// * `NotFound` - the resource, requester, owner or an ancestor is missing
    /// * `UnknownOperator` - a policy uses an unregistered operator
    /// * `NoDecision` - no verdict was reached
    /// * `InvalidCompounder` - the compounder continued on its final call
    pub async fn check_perm_with(&self, request: CheckPermRequest, compounder: &dyn Compounder) -> Result<bool> {
        let start = Instant::now();

        let resource = match request.resource {
            ResourceRef::Id(id) => self.resources.retrieve_resource(id).await?,
            ResourceRef::Resource(resource) => resource,
        };

        debug!(
            "Permission check: requester={}, access={:?}, resource={}",
            request.requester,
            request.access.as_slice(),
            resource.id
        );

        let ctx = Arc::new(CheckPermContext::new(request.requester, request.access, resource.id));
        let policies = self.relevance.retrieve_relevant_policies(&resource).await?;
        let mode = compounder.mode();

        let mut reactions: Vec<Reaction> = Vec::with_capacity(policies.len());
        for (index, policy) in policies.iter().enumerate() {
            let reaction = policy.apply_to(&ctx, &self.checks).await?;
            debug!("Policy {} (priority={}) reacted {:?}", policy.id, policy.priority, reaction);
            reactions.push(reaction);

            if !mode.per_policy() {
                continue;
            }

            let input = CompoundInput {
                policies: &policies,
                reactions: &reactions,
                index,
                current: reaction,
            };

            if let CompoundStep::Conclude(verdict) = compounder.compound(&input)? {
                info!(
                    "Permission {} for {} on {} by policy {} in {:?}",
                    verdict_label(verdict),
                    ctx.requester,
                    ctx.resource,
                    policy.id,
                    start.elapsed()
                );
                return Ok(verdict);
            }
        }

        if mode.at_end() {
            let input = CompoundInput {
                policies: &policies,
                reactions: &reactions,
                index: policies.len(),
                current: None,
            };

            return match compounder.compound(&input)? {
                CompoundStep::Conclude(verdict) => {
                    info!(
                        "Permission {} for {} on {} after {} policies in {:?}",
                        verdict_label(verdict),
                        ctx.requester,
                        ctx.resource,
                        policies.len(),
                        start.elapsed()
                    );
                    Ok(verdict)
                }
                CompoundStep::Continue => Err(AuthzError::InvalidCompounder(
                    "compounder did not conclude after the last policy".to_string(),
                )),
            };
        }

        warn!(
            "No policy decided access for {} on {} ({} candidates)",
            ctx.requester,
            ctx.resource,
            policies.len()
        );
        Err(AuthzError::NoDecision)
    }
}

fn verdict_label(verdict: bool) -> &'static str {
    if verdict {
        "granted"
    } else {
        "denied"
    }
}
