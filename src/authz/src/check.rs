//! Policy condition trees and their compiler
//!
//! A condition tree is a JSON object whose keys are AND-ed:
//!
//! ```json
//! {
//!   "access": ["read", "list"],
//!   "requester": { "subof": "5c0c7ee0-..." },
//!   "or": [{ "resourceId": "..." }, { "businessHours": true }]
//! }
//! ```
//!
//! Built-in keys are `requester`, `resourceId`, `access`, `not`, `nor`, `or`
//! and `and`. Any other key is a custom operator resolved through a
//! [`CheckOps`] registry when the tree is compiled.

use crate::cache::{canonical_key, CanonicalKey, MemoCache};
use crate::config::CacheConfig;
use crate::error::{AuthzError, Result};
use crate::graph::EntityGraph;
use crate::predicate::{all_of, any_of, constant, negate, predicate, sync_predicate, CheckPredicate, EntityPredicate};
use crate::registry::{CheckOps, EntityRestrictorOps, CHECK_BUILTINS};
use crate::restrictor::{Restrictor, RestrictorCompiler};
use crate::types::{Access, CheckPermContext, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Single key of a condition tree
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Restrictor applied to the requesting entity
    Requester(Restrictor),

    /// Target resource identity
    ResourceId(ResourceId),

    /// Every requested access name must be in this set
    Access(Access),

    /// Negated subtree
    Not(Box<ConditionTree>),

    /// No subtree matches
    Nor(Vec<ConditionTree>),

    /// At least one subtree matches (left to right)
    Or(Vec<ConditionTree>),

    /// Every subtree matches (left to right)
    And(Vec<ConditionTree>),

    /// Registry-resolved operator
    Custom {
        /// Operator name
        op: String,
        /// Opaque argument handed to the operator factory
        arg: Value,
    },
}

impl Condition {
    fn key(&self) -> &str {
        match self {
            Condition::Requester(_) => "requester",
            Condition::ResourceId(_) => "resourceId",
            Condition::Access(_) => "access",
            Condition::Not(_) => "not",
            Condition::Nor(_) => "nor",
            Condition::Or(_) => "or",
            Condition::And(_) => "and",
            Condition::Custom { op, .. } => op.as_str(),
        }
    }

    fn parse(key: String, value: Value) -> Result<Self> {
        let condition = match key.as_str() {
            "requester" => Condition::Requester(Restrictor::try_from(value)?),
            "resourceId" => {
                let id = value
                    .as_str()
                    .ok_or_else(|| AuthzError::InvalidPolicy("resourceId expects an id string".to_string()))?
                    .parse::<ResourceId>()
                    .map_err(|_| AuthzError::InvalidPolicy(format!("resourceId expects a resource id, got {}", value)))?;
                Condition::ResourceId(id)
            }
            "access" => Condition::Access(
                serde_json::from_value(value)
                    .map_err(|e| AuthzError::InvalidPolicy(format!("access expects a string or list: {}", e)))?,
            ),
            "not" => Condition::Not(Box::new(ConditionTree::try_from(value)?)),
            "nor" => Condition::Nor(parse_subtrees(&key, value)?),
            "or" => Condition::Or(parse_subtrees(&key, value)?),
            "and" => Condition::And(parse_subtrees(&key, value)?),
            _ => Condition::Custom { op: key, arg: value },
        };
        Ok(condition)
    }

    fn into_value(self) -> Value {
        match self {
            Condition::Requester(restrictor) => restrictor.into(),
            Condition::ResourceId(id) => Value::String(id.to_string()),
            Condition::Access(Access::One(name)) => Value::String(name),
            Condition::Access(Access::Many(names)) => Value::Array(names.into_iter().map(Value::String).collect()),
            Condition::Not(tree) => (*tree).into(),
            Condition::Nor(trees) | Condition::Or(trees) | Condition::And(trees) => {
                Value::Array(trees.into_iter().map(Value::from).collect())
            }
            Condition::Custom { arg, .. } => arg,
        }
    }
}

fn parse_subtrees(key: &str, value: Value) -> Result<Vec<ConditionTree>> {
    match value {
        Value::Array(items) => items.into_iter().map(ConditionTree::try_from).collect(),
        other => Err(AuthzError::InvalidPolicy(format!("'{}' expects a list of conditions, got {}", key, other))),
    }
}

/// AND-ed sequence of conditions
///
/// The empty tree always matches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ConditionTree {
    conditions: Vec<Condition>,
}

impl ConditionTree {
    /// Create an empty (always matching) tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditions in evaluation order
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether the tree has no conditions
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Append a condition
    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Require the requester to satisfy `restrictor`
    pub fn requester(self, restrictor: Restrictor) -> Self {
        self.with(Condition::Requester(restrictor))
    }

    /// Require the target resource to be `id`
    pub fn resource_id(self, id: ResourceId) -> Self {
        self.with(Condition::ResourceId(id))
    }

    /// Require the requested access to lie within `allowed`
    pub fn access(self, allowed: impl Into<Access>) -> Self {
        self.with(Condition::Access(allowed.into()))
    }

    /// Require `tree` not to match
    pub fn not(self, tree: ConditionTree) -> Self {
        self.with(Condition::Not(Box::new(tree)))
    }

    /// Require none of `trees` to match
    pub fn nor(self, trees: Vec<ConditionTree>) -> Self {
        self.with(Condition::Nor(trees))
    }

    /// Require at least one of `trees` to match
    pub fn or(self, trees: Vec<ConditionTree>) -> Self {
        self.with(Condition::Or(trees))
    }

    /// Require every one of `trees` to match
    pub fn and(self, trees: Vec<ConditionTree>) -> Self {
        self.with(Condition::And(trees))
    }

    /// Require a custom operator to match
    pub fn custom(self, op: impl Into<String>, arg: Value) -> Self {
        self.with(Condition::Custom { op: op.into(), arg })
    }

    /// First custom key, at any depth, that is named like a built-in one
    ///
    /// Such keys serialize like the built-in they shadow.
    fn shadowed_builtin(&self) -> Option<&str> {
        self.conditions.iter().find_map(|condition| match condition {
            Condition::Custom { op, .. } if CHECK_BUILTINS.contains(&op.as_str()) => Some(op.as_str()),
            Condition::Requester(restrictor) => restrictor.shadowed_builtin(),
            Condition::Not(tree) => tree.shadowed_builtin(),
            Condition::Nor(trees) | Condition::Or(trees) | Condition::And(trees) => {
                trees.iter().find_map(ConditionTree::shadowed_builtin)
            }
            _ => None,
        })
    }
}

impl TryFrom<Value> for ConditionTree {
    type Error = AuthzError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(object) => {
                let conditions = object
                    .into_iter()
                    .map(|(key, value)| Condition::parse(key, value))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self { conditions })
            }
            other => Err(AuthzError::InvalidPolicy(format!("condition tree must be an object, got {}", other))),
        }
    }
}

impl From<ConditionTree> for Value {
    fn from(tree: ConditionTree) -> Self {
        let mut object = Map::new();
        let mut overflow = Vec::new();

        for condition in tree.conditions {
            let key = condition.key().to_string();
            let value = condition.into_value();

            // A JSON object holds each key once; repeats move into an `and` list
            if object.contains_key(&key) {
                let mut single = Map::new();
                single.insert(key, value);
                overflow.push(Value::Object(single));
            } else {
                object.insert(key, value);
            }
        }

        if !overflow.is_empty() {
            match object.get_mut("and") {
                Some(Value::Array(existing)) => existing.extend(overflow),
                _ => {
                    object.insert("and".to_string(), Value::Array(overflow));
                }
            }
        }

        Value::Object(object)
    }
}

/// Compiles [`ConditionTree`]s into [`CheckPredicate`]s
///
/// Compilation is synchronous and performs no I/O; only the resulting
/// predicates suspend (to fetch the requester or walk its ancestors).
pub struct CheckCompiler {
    graph: Arc<EntityGraph>,
    restrictors: RestrictorCompiler,
    ops: Arc<CheckOps>,
    cache: Option<MemoCache<CanonicalKey, CheckPredicate>>,
}

impl CheckCompiler {
    /// Create a compiler with explicit registries
    ///
    /// # Arguments
    ///
    /// * `graph` - Entity graph used by `requester` conditions
    /// * `restrictor_ops` - Custom restrictor operators
    /// * `check_ops` - Custom condition operators
    pub fn new(graph: Arc<EntityGraph>, restrictor_ops: Arc<EntityRestrictorOps>, check_ops: Arc<CheckOps>) -> Self {
        Self {
            restrictors: RestrictorCompiler::new(Arc::clone(&graph), restrictor_ops),
            graph,
            ops: check_ops,
            cache: None,
        }
    }

    /// Create a compiler over the process-wide registries
    pub fn with_shared_registries(graph: Arc<EntityGraph>) -> Self {
        Self::new(graph, EntityRestrictorOps::shared(), CheckOps::shared())
    }

    /// Memoize compiled trees when `config` enables it
    pub fn with_cache(mut self, config: &CacheConfig) -> Self {
        self.cache = MemoCache::from_config(config);
        self
    }

    /// Restrictor compiler used for `requester` conditions
    pub fn restrictors(&self) -> &RestrictorCompiler {
        &self.restrictors
    }

    /// Registry consulted for custom conditions
    pub fn ops(&self) -> &Arc<CheckOps> {
        &self.ops
    }

    /// Compile a condition tree
    ///
    /// Fails with `UnknownOperator` before anything is evaluated if any key,
    /// at any depth, has no registered operator.
    pub fn compile(&self, tree: &ConditionTree) -> Result<CheckPredicate> {
        let Some(cache) = &self.cache else {
            return self.compile_tree(tree);
        };

        // Built-in names never reach a registry
        if let Some(op) = tree.shadowed_builtin() {
            return Err(AuthzError::UnknownOperator(op.to_string()));
        }

        let key = canonical_key(tree)?;
        if let Some(hit) = cache.get(&key) {
            return Ok(hit);
        }

        let compiled = self.compile_tree(tree)?;
        cache.insert(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Drop every memoized predicate
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            debug!("Clearing {} compiled checks", cache.len());
            cache.clear();
        }
    }

    fn compile_tree(&self, tree: &ConditionTree) -> Result<CheckPredicate> {
        let compiled = tree
            .conditions
            .iter()
            .map(|condition| self.compile_condition(condition))
            .collect::<Result<Vec<_>>>()?;
        Ok(all_of(compiled))
    }

    fn compile_all(&self, trees: &[ConditionTree]) -> Result<Vec<CheckPredicate>> {
        trees.iter().map(|tree| self.compile_tree(tree)).collect()
    }

    fn compile_condition(&self, condition: &Condition) -> Result<CheckPredicate> {
        match condition {
            // No entity fetch needed
            Condition::Requester(restrictor) if restrictor.is_wildcard() => Ok(constant(true)),
            Condition::Requester(restrictor) => {
                let matcher = self.restrictors.compile(restrictor)?;
                let graph = Arc::clone(&self.graph);
                Ok(predicate(move |ctx: Arc<CheckPermContext>| {
                    requester_matches(Arc::clone(&graph), Arc::clone(&matcher), ctx)
                }))
            }
            Condition::ResourceId(id) => {
                let id = *id;
                Ok(sync_predicate(move |ctx: &CheckPermContext| ctx.resource == id))
            }
            Condition::Access(allowed) => {
                let allowed = allowed.clone();
                Ok(sync_predicate(move |ctx: &CheckPermContext| ctx.access.is_within(&allowed)))
            }
            Condition::Not(tree) => Ok(negate(self.compile_tree(tree)?)),
            Condition::Nor(trees) => Ok(negate(any_of(self.compile_all(trees)?))),
            Condition::Or(trees) => Ok(any_of(self.compile_all(trees)?)),
            Condition::And(trees) => Ok(all_of(self.compile_all(trees)?)),
            Condition::Custom { op, arg } => self.ops.build(op, arg),
        }
    }
}

async fn requester_matches(
    graph: Arc<EntityGraph>,
    matcher: EntityPredicate,
    ctx: Arc<CheckPermContext>,
) -> Result<bool> {
    let requester = ctx.requester_entity(&graph).await?;
    matcher(requester).await
}
