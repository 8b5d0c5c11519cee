//! Entity restrictors and their compiler
//!
//! A restrictor is a small expression over an entity. Its JSON form is either
//! `"*"` (any entity), `"none"` (used by policy selectors to match resources
//! without an owner), or an object whose keys are AND-ed:
//!
//! ```json
//! { "subof": "5c0c7ee0-...", "department": "finance" }
//! ```
//!
//! `id` and `subof` are built in; every other key is a custom operator looked
//! up in an [`EntityRestrictorOps`] registry.
//!
//! A list of restrictors is their conjunction, which lets a key appear more
//! than once: `[{ "subof": "..." }, { "subof": "..." }]`.

use crate::error::{AuthzError, Result};
use crate::graph::EntityGraph;
use crate::predicate::{all_of, constant, predicate, sync_predicate, EntityPredicate};
use crate::registry::{EntityRestrictorOps, RESTRICTOR_BUILTINS};
use crate::types::{Entity, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

const WILDCARD: &str = "*";
const NO_OWNER: &str = "none";

/// Entity restriction expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Restrictor {
    /// Matches every entity
    Wildcard,

    /// Matches no entity; as a selector owner it matches owner-less resources
    NoOwner,

    /// Conjunction of clauses, evaluated left to right
    All(Vec<RestrictorClause>),
}

/// Single key of an object restrictor
#[derive(Debug, Clone, PartialEq)]
pub enum RestrictorClause {
    /// Entity identity
    Id(EntityId),

    /// The entity itself or any entity it inherits from
    SubOf(EntityId),

    /// Registry-resolved operator
    Custom {
        /// Operator name
        op: String,
        /// Opaque argument handed to the operator factory
        arg: Value,
    },
}

impl Restrictor {
    /// Restrictor matching exactly `id`
    pub fn id(id: EntityId) -> Self {
        Restrictor::All(vec![RestrictorClause::Id(id)])
    }

    /// Restrictor matching `id` and everything below it
    pub fn sub_of(id: EntityId) -> Self {
        Restrictor::All(vec![RestrictorClause::SubOf(id)])
    }

    /// Restrictor with a single custom clause
    pub fn custom(op: impl Into<String>, arg: Value) -> Self {
        Restrictor::All(vec![RestrictorClause::Custom { op: op.into(), arg }])
    }

    /// Append a clause (turns `Wildcard` into a single-clause conjunction)
    pub fn and(self, clause: RestrictorClause) -> Self {
        match self {
            Restrictor::Wildcard => Restrictor::All(vec![clause]),
            Restrictor::NoOwner => Restrictor::NoOwner,
            Restrictor::All(mut clauses) => {
                clauses.push(clause);
                Restrictor::All(clauses)
            }
        }
    }

    /// Whether this restrictor accepts every entity
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Restrictor::Wildcard)
    }

    /// First custom clause named like a built-in key, if any
    pub(crate) fn shadowed_builtin(&self) -> Option<&str> {
        let Restrictor::All(clauses) = self else {
            return None;
        };

        clauses.iter().find_map(|clause| match clause {
            RestrictorClause::Custom { op, .. } if RESTRICTOR_BUILTINS.contains(&op.as_str()) => Some(op.as_str()),
            _ => None,
        })
    }
}

impl RestrictorClause {
    fn key(&self) -> &str {
        match self {
            RestrictorClause::Id(_) => "id",
            RestrictorClause::SubOf(_) => "subof",
            RestrictorClause::Custom { op, .. } => op.as_str(),
        }
    }

    fn into_value(self) -> Value {
        match self {
            RestrictorClause::Id(id) | RestrictorClause::SubOf(id) => Value::String(id.to_string()),
            RestrictorClause::Custom { arg, .. } => arg,
        }
    }
}

fn parse_entity_id(key: &str, value: &Value) -> Result<EntityId> {
    value
        .as_str()
        .ok_or_else(|| AuthzError::InvalidPolicy(format!("restrictor '{}' expects an entity id string", key)))?
        .parse()
        .map_err(|_| AuthzError::InvalidPolicy(format!("restrictor '{}' expects an entity id, got {}", key, value)))
}

fn parse_object(object: Map<String, Value>) -> Result<Restrictor> {
    let mut clauses = Vec::with_capacity(object.len());

    for (key, value) in object {
        match key.as_str() {
            "id" | "subof" if value.as_str() == Some(WILDCARD) => {}
            "id" if value.as_str() == Some(NO_OWNER) => return Ok(Restrictor::NoOwner),
            "id" => clauses.push(RestrictorClause::Id(parse_entity_id(&key, &value)?)),
            "subof" => clauses.push(RestrictorClause::SubOf(parse_entity_id(&key, &value)?)),
            _ => clauses.push(RestrictorClause::Custom { op: key, arg: value }),
        }
    }

    Ok(Restrictor::All(clauses))
}

impl TryFrom<Value> for Restrictor {
    type Error = AuthzError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Restrictor::Wildcard),
            Value::String(s) if s == WILDCARD => Ok(Restrictor::Wildcard),
            Value::String(s) if s == NO_OWNER => Ok(Restrictor::NoOwner),
            Value::Object(object) => parse_object(object),
            Value::Array(items) => {
                let mut clauses = Vec::new();
                for item in items {
                    match Restrictor::try_from(item)? {
                        Restrictor::Wildcard => {}
                        Restrictor::NoOwner => return Ok(Restrictor::NoOwner),
                        Restrictor::All(more) => clauses.extend(more),
                    }
                }
                Ok(Restrictor::All(clauses))
            }
            other => Err(AuthzError::InvalidPolicy(format!("invalid restrictor: {}", other))),
        }
    }
}

impl From<Restrictor> for Value {
    fn from(restrictor: Restrictor) -> Self {
        match restrictor {
            Restrictor::Wildcard => Value::String(WILDCARD.to_string()),
            Restrictor::NoOwner => Value::String(NO_OWNER.to_string()),
            Restrictor::All(clauses) => {
                let mut keys = HashSet::with_capacity(clauses.len());
                let repeated = !clauses.iter().all(|clause| keys.insert(clause.key().to_string()));

                // A JSON object holds each key once; repeats need the list form
                if repeated {
                    let items = clauses
                        .into_iter()
                        .map(|clause| {
                            let mut single = Map::new();
                            single.insert(clause.key().to_string(), clause.into_value());
                            Value::Object(single)
                        })
                        .collect();
                    return Value::Array(items);
                }

                let object = clauses
                    .into_iter()
                    .map(|clause| (clause.key().to_string(), clause.into_value()))
                    .collect();
                Value::Object(object)
            }
        }
    }
}

/// Compiles [`Restrictor`]s into [`EntityPredicate`]s
#[derive(Clone)]
pub struct RestrictorCompiler {
    graph: Arc<EntityGraph>,
    ops: Arc<EntityRestrictorOps>,
}

impl RestrictorCompiler {
    /// Create a compiler over `graph` using the custom operators in `ops`
    pub fn new(graph: Arc<EntityGraph>, ops: Arc<EntityRestrictorOps>) -> Self {
        Self { graph, ops }
    }

    /// Registry consulted for custom clauses
    pub fn ops(&self) -> &Arc<EntityRestrictorOps> {
        &self.ops
    }

    /// Compile a restrictor
    ///
    /// Fails with `UnknownOperator` if a custom clause is not registered.
    pub fn compile(&self, restrictor: &Restrictor) -> Result<EntityPredicate> {
        match restrictor {
            Restrictor::Wildcard => Ok(constant(true)),
            Restrictor::NoOwner => Ok(constant(false)),
            Restrictor::All(clauses) => {
                let compiled = clauses
                    .iter()
                    .map(|clause| self.compile_clause(clause))
                    .collect::<Result<Vec<_>>>()?;
                Ok(all_of(compiled))
            }
        }
    }

    fn compile_clause(&self, clause: &RestrictorClause) -> Result<EntityPredicate> {
        match clause {
            RestrictorClause::Id(target) => {
                let target = *target;
                Ok(sync_predicate(move |entity: &Entity| entity.id == target))
            }
            RestrictorClause::SubOf(target) => {
                let target = *target;
                let graph = Arc::clone(&self.graph);
                Ok(predicate(move |entity: Arc<Entity>| {
                    is_sub_of(Arc::clone(&graph), entity, target)
                }))
            }
            RestrictorClause::Custom { op, arg } => self.ops.build(op, arg),
        }
    }
}

async fn is_sub_of(graph: Arc<EntityGraph>, entity: Arc<Entity>, target: EntityId) -> Result<bool> {
    if entity.id == target {
        return Ok(true);
    }

    // Direct parents need no fetch
    if entity.parents.contains(&target) {
        return Ok(true);
    }

    let ancestors = graph.ancestors_of(&entity, false).await?;
    Ok(ancestors.contains(&target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityStore, InMemoryStore};
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_parse_forms() {
        let id = EntityId::new();

        assert_eq!(Restrictor::try_from(json!("*")).unwrap(), Restrictor::Wildcard);
        assert_eq!(Restrictor::try_from(json!("none")).unwrap(), Restrictor::NoOwner);
        assert_eq!(Restrictor::try_from(json!({ "id": "none" })).unwrap(), Restrictor::NoOwner);
        assert_eq!(
            Restrictor::try_from(json!({ "id": id.to_string() })).unwrap(),
            Restrictor::id(id)
        );
        assert_eq!(
            Restrictor::try_from(json!({ "subof": "*" })).unwrap(),
            Restrictor::All(vec![])
        );
        assert_eq!(
            Restrictor::try_from(json!({ "level": 3 })).unwrap(),
            Restrictor::custom("level", json!(3))
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Restrictor::try_from(json!(42)).is_err());
        assert!(Restrictor::try_from(json!("someone")).is_err());
        assert!(Restrictor::try_from(json!({ "subof": "not-a-uuid" })).is_err());
        assert!(Restrictor::try_from(json!({ "id": 7 })).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let restrictor = Restrictor::sub_of(EntityId::new()).and(RestrictorClause::Custom {
            op: "tier".to_string(),
            arg: json!("gold"),
        });

        let value = serde_json::to_value(&restrictor).unwrap();
        let back: Restrictor = serde_json::from_value(value).unwrap();
        assert_eq!(back, restrictor);
    }

    #[test]
    fn test_repeated_keys_keep_every_clause() {
        let (a, b) = (EntityId::new(), EntityId::new());
        let restrictor = Restrictor::sub_of(a).and(RestrictorClause::SubOf(b));

        let value = serde_json::to_value(&restrictor).unwrap();
        assert_eq!(
            value,
            json!([{ "subof": a.to_string() }, { "subof": b.to_string() }])
        );

        let back: Restrictor = serde_json::from_value(value).unwrap();
        assert_eq!(back, restrictor);
        assert_ne!(
            serde_json::to_value(Restrictor::sub_of(b)).unwrap(),
            serde_json::to_value(&restrictor).unwrap()
        );
    }

    #[test]
    fn test_parse_list_form() {
        let (a, b) = (EntityId::new(), EntityId::new());

        let parsed = Restrictor::try_from(json!([{ "id": a.to_string() }, "*", { "subof": b.to_string(), "tier": 1 }]))
            .unwrap();
        assert_eq!(
            parsed,
            Restrictor::id(a)
                .and(RestrictorClause::SubOf(b))
                .and(RestrictorClause::Custom {
                    op: "tier".to_string(),
                    arg: json!(1)
                })
        );

        assert_eq!(
            Restrictor::try_from(json!([{ "subof": a.to_string() }, "none"])).unwrap(),
            Restrictor::NoOwner
        );
        assert!(Restrictor::try_from(json!([{ "subof": a.to_string() }, 5])).is_err());
    }

    #[test]
    fn test_shadowed_builtin() {
        assert_eq!(Restrictor::custom("subof", json!(null)).shadowed_builtin(), Some("subof"));
        assert_eq!(Restrictor::custom("tier", json!(1)).shadowed_builtin(), None);
        assert_eq!(Restrictor::Wildcard.shadowed_builtin(), None);
    }

    async fn fixture() -> (Arc<InMemoryStore>, RestrictorCompiler) {
        let store = Arc::new(InMemoryStore::new());
        let graph = Arc::new(EntityGraph::new(store.clone()));
        let compiler = RestrictorCompiler::new(graph, Arc::new(EntityRestrictorOps::new()));
        (store, compiler)
    }

    #[tokio::test]
    async fn test_subof_matches_self_and_ancestors() {
        let (store, compiler) = fixture().await;
        let root = store.create_entity(HashSet::new()).await.unwrap();
        let group = store.create_entity(HashSet::from([root.id])).await.unwrap();
        let member = store.create_entity(HashSet::from([group.id])).await.unwrap();
        let stranger = store.create_entity(HashSet::new()).await.unwrap();

        let p = compiler.compile(&Restrictor::sub_of(root.id)).unwrap();

        assert!(p(Arc::new(root.clone())).await.unwrap());
        assert!(p(Arc::new(group)).await.unwrap());
        assert!(p(Arc::new(member)).await.unwrap());
        assert!(!p(Arc::new(stranger)).await.unwrap());
    }

    #[tokio::test]
    async fn test_id_and_subof_are_anded() {
        let (store, compiler) = fixture().await;
        let group = store.create_entity(HashSet::new()).await.unwrap();
        let alice = store.create_entity(HashSet::from([group.id])).await.unwrap();
        let bob = store.create_entity(HashSet::from([group.id])).await.unwrap();

        let restrictor = Restrictor::sub_of(group.id).and(RestrictorClause::Id(alice.id));
        let p = compiler.compile(&restrictor).unwrap();

        assert!(p(Arc::new(alice)).await.unwrap());
        assert!(!p(Arc::new(bob)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_custom_operator_fails_compilation() {
        let (_store, compiler) = fixture().await;
        let err = compiler.compile(&Restrictor::custom("clearance", json!(5))).err().unwrap();
        assert!(matches!(err, AuthzError::UnknownOperator(op) if op == "clearance"));
    }

    #[tokio::test]
    async fn test_custom_operator() {
        let (store, compiler) = fixture().await;
        let special = store.create_entity(HashSet::new()).await.unwrap();
        let special_id = special.id;

        compiler
            .ops()
            .insert("special", move |arg: &Value| {
                let wanted = arg.as_bool().unwrap_or(true);
                Ok(sync_predicate(move |e: &Entity| (e.id == special_id) == wanted))
            })
            .unwrap();

        let p = compiler.compile(&Restrictor::custom("special", json!(true))).unwrap();
        assert!(p(Arc::new(special)).await.unwrap());
        assert!(!p(Arc::new(Entity::new(EntityId::new()))).await.unwrap());
    }

    #[tokio::test]
    async fn test_wildcard_and_no_owner() {
        let (_store, compiler) = fixture().await;
        let anyone = Arc::new(Entity::new(EntityId::new()));

        assert!(compiler.compile(&Restrictor::Wildcard).unwrap()(anyone.clone()).await.unwrap());
        assert!(!compiler.compile(&Restrictor::NoOwner).unwrap()(anyone).await.unwrap());
    }
}
