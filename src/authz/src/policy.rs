//! Policy definition and per-policy evaluation

use crate::check::{CheckCompiler, ConditionTree};
use crate::error::{AuthzError, Result};
use crate::restrictor::Restrictor;
use crate::types::{CheckPermContext, PolicyId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of applying one policy: allow, deny, or abstain (`None`)
pub type Reaction = Option<bool>;

/// Which resources a policy applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum PolicySelector {
    /// Every resource (`"*"`)
    Wildcard,

    /// Resources matching type and owner constraints
    Match(SelectorMatch),
}

/// Object selector; absent fields do not constrain
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorMatch {
    /// Resource type, or `"*"` for any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    /// Restrictor on the resource owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_owner: Option<Restrictor>,
}

impl PolicySelector {
    /// Selector constrained to one resource type
    pub fn resource_type(resource_type: impl Into<String>) -> Self {
        PolicySelector::Match(SelectorMatch {
            resource_type: Some(resource_type.into()),
            resource_owner: None,
        })
    }

    /// Selector constrained on the resource owner
    pub fn resource_owner(owner: Restrictor) -> Self {
        PolicySelector::Match(SelectorMatch {
            resource_type: None,
            resource_owner: Some(owner),
        })
    }
}

impl TryFrom<Value> for PolicySelector {
    type Error = AuthzError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "*" => Ok(PolicySelector::Wildcard),
            value @ Value::Object(_) => Ok(PolicySelector::Match(
                serde_json::from_value(value).map_err(|e| AuthzError::InvalidPolicy(format!("invalid selector: {}", e)))?,
            )),
            other => Err(AuthzError::InvalidPolicy(format!("invalid selector: {}", other))),
        }
    }
}

impl From<PolicySelector> for Value {
    fn from(selector: PolicySelector) -> Self {
        match selector {
            PolicySelector::Wildcard => Value::String("*".to_string()),
            PolicySelector::Match(m) => serde_json::to_value(m).unwrap_or(Value::Null),
        }
    }
}

/// One condition/reaction pair of a policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyContent {
    /// Condition the request must satisfy
    #[serde(default)]
    pub check: ConditionTree,

    /// `true` to allow, `false` to deny, absent to abstain
    #[serde(default, deserialize_with = "deserialize_react", skip_serializing_if = "Option::is_none")]
    pub react: Option<bool>,
}

impl PolicyContent {
    /// Create a content entry
    pub fn new(check: ConditionTree, react: Option<bool>) -> Self {
        Self { check, react }
    }
}

fn deserialize_react<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ReactRepr {
        Flag(bool),
        Word(String),
    }

    match Option::<ReactRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(ReactRepr::Flag(flag)) => Ok(Some(flag)),
        Some(ReactRepr::Word(word)) => match word.as_str() {
            "allow" => Ok(Some(true)),
            "deny" => Ok(Some(false)),
            other => Err(D::Error::custom(format!("react must be a boolean, 'allow' or 'deny', got '{}'", other))),
        },
    }
}

fn deserialize_contents<'de, D>(deserializer: D) -> std::result::Result<Vec<PolicyContent>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<PolicyContent>::deserialize(deserializer)?;
    Ok(dedup(raw))
}

fn dedup(contents: Vec<PolicyContent>) -> Vec<PolicyContent> {
    let mut unique: Vec<PolicyContent> = Vec::with_capacity(contents.len());
    for content in contents {
        if !unique.contains(&content) {
            unique.push(content);
        }
    }
    unique
}

/// Prioritized, conditionally reacting rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy identifier
    #[serde(default)]
    pub id: PolicyId,

    /// Selector; a policy without one is only reachable through resource bindings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PolicySelector>,

    /// Contents in evaluation order, without structural duplicates
    #[serde(default, deserialize_with = "deserialize_contents")]
    pub contents: Vec<PolicyContent>,

    /// Policy priority (higher = evaluated first)
    #[serde(default)]
    pub priority: i32,
}

impl Policy {
    /// Create an empty policy with a fresh id
    pub fn new() -> Self {
        Self {
            id: PolicyId::new(),
            selector: None,
            contents: Vec::new(),
            priority: 0,
        }
    }

    /// Set the selector
    pub fn with_selector(mut self, selector: PolicySelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Append a content entry (ignored if an identical one exists)
    pub fn with_content(mut self, check: ConditionTree, react: Option<bool>) -> Self {
        self.push_content(PolicyContent::new(check, react));
        self
    }

    /// Append a content entry in place; returns `false` for duplicates
    pub fn push_content(&mut self, content: PolicyContent) -> bool {
        if self.contents.contains(&content) {
            return false;
        }
        self.contents.push(content);
        true
    }

    /// Evaluate this policy against a request
    ///
    /// Contents are scanned in order. A matching deny returns `Some(false)` at
    /// once; a matching allow is remembered and scanning goes on, so a later
    /// deny still wins. Contents without a reaction never change the outcome.
    ///
    /// Every content is compiled before any is evaluated.
    pub async fn apply_to(&self, ctx: &Arc<CheckPermContext>, checks: &CheckCompiler) -> Result<Reaction> {
        let compiled = self
            .contents
            .iter()
            .map(|content| checks.compile(&content.check).map(|check| (check, content.react)))
            .collect::<Result<Vec<_>>>()?;

        let mut allowed = false;
        for (check, react) in compiled {
            if !check(Arc::clone(ctx)).await? {
                continue;
            }

            match react {
                Some(false) => return Ok(Some(false)),
                Some(true) => allowed = true,
                None => {}
            }
        }

        Ok(allowed.then_some(true))
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EntityGraph;
    use crate::registry::{CheckOps, EntityRestrictorOps};
    use crate::store::InMemoryStore;
    use crate::types::{EntityId, ResourceId};
    use serde_json::json;

    fn compiler() -> CheckCompiler {
        let graph = Arc::new(EntityGraph::new(Arc::new(InMemoryStore::new())));
        CheckCompiler::new(graph, Arc::new(EntityRestrictorOps::new()), Arc::new(CheckOps::new()))
    }

    fn read_request() -> Arc<CheckPermContext> {
        Arc::new(CheckPermContext::new(EntityId::new(), "read", ResourceId::new()))
    }

    fn read() -> ConditionTree {
        ConditionTree::new().access("read")
    }

    #[tokio::test]
    async fn test_later_deny_overrides_allow() {
        let policy = Policy::new()
            .with_content(read(), Some(true))
            .with_content(ConditionTree::new(), Some(false));

        let reaction = policy.apply_to(&read_request(), &compiler()).await.unwrap();
        assert_eq!(reaction, Some(false));
    }

    #[tokio::test]
    async fn test_abstention_keeps_flag() {
        let policy = Policy::new()
            .with_content(read(), Some(true))
            .with_content(ConditionTree::new(), None);

        let reaction = policy.apply_to(&read_request(), &compiler()).await.unwrap();
        assert_eq!(reaction, Some(true));
    }

    #[tokio::test]
    async fn test_no_match_abstains() {
        let policy = Policy::new().with_content(ConditionTree::new().access("write"), Some(true));

        let reaction = policy.apply_to(&read_request(), &compiler()).await.unwrap();
        assert_eq!(reaction, None);
    }

    #[tokio::test]
    async fn test_unknown_operator_fails_before_evaluation() {
        let policy = Policy::new()
            .with_content(ConditionTree::new(), Some(false))
            .with_content(ConditionTree::new().custom("fooBar", json!(1)), Some(true));

        let err = policy.apply_to(&read_request(), &compiler()).await.unwrap_err();
        assert!(matches!(err, AuthzError::UnknownOperator(_)));
    }

    #[test]
    fn test_contents_deduplicated() {
        let mut policy = Policy::new().with_content(read(), Some(true)).with_content(read(), Some(true));
        assert_eq!(policy.contents.len(), 1);
        assert!(!policy.push_content(PolicyContent::new(read(), Some(true))));
        assert!(policy.push_content(PolicyContent::new(read(), Some(false))));

        let parsed: Policy = serde_json::from_value(json!({
            "selector": "*",
            "contents": [
                { "check": { "access": "read" }, "react": true },
                { "check": { "access": "read" }, "react": true }
            ]
        }))
        .unwrap();
        assert_eq!(parsed.contents.len(), 1);
    }

    #[test]
    fn test_react_accepts_words() {
        let parsed: Policy = serde_json::from_value(json!({
            "contents": [
                { "check": {}, "react": "allow" },
                { "check": { "access": "write" }, "react": "deny" },
                { "check": { "access": "list" } }
            ]
        }))
        .unwrap();

        let reacts: Vec<Option<bool>> = parsed.contents.iter().map(|c| c.react).collect();
        assert_eq!(reacts, vec![Some(true), Some(false), None]);
        assert!(parsed.selector.is_none());
        assert_eq!(parsed.priority, 0);

        let bad = serde_json::from_value::<Policy>(json!({ "contents": [{ "react": "maybe" }] }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_selector_forms() {
        let owner = EntityId::new();
        let parsed: PolicySelector = serde_json::from_value(json!({
            "resourceType": "document",
            "resourceOwner": { "subof": owner.to_string() }
        }))
        .unwrap();

        assert_eq!(
            parsed,
            PolicySelector::Match(SelectorMatch {
                resource_type: Some("document".to_string()),
                resource_owner: Some(Restrictor::sub_of(owner)),
            })
        );

        let wildcard: PolicySelector = serde_json::from_value(json!("*")).unwrap();
        assert_eq!(wildcard, PolicySelector::Wildcard);
        assert!(serde_json::from_value::<PolicySelector>(json!(5)).is_err());
    }
}
