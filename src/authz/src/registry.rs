//! Custom operator registries
//!
//! Restrictors and condition trees may use keys beyond the built-in ones. Each
//! such key is looked up in a registry that maps the key to a factory; the
//! factory receives the key's argument value and returns a compiled predicate.

use crate::error::{AuthzError, Result};
use crate::predicate::{CheckPredicate, EntityPredicate};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

/// Factory turning an operator argument into a predicate
pub type OperatorFactory<P> = Arc<dyn Fn(&Value) -> Result<P> + Send + Sync>;

/// Keys handled natively by the restrictor compiler
pub const RESTRICTOR_BUILTINS: &[&str] = &["id", "subof"];

/// Keys handled natively by the check compiler
pub const CHECK_BUILTINS: &[&str] = &["requester", "resourceId", "access", "not", "nor", "or", "and"];

/// Name to factory table
///
/// Names are unique; registering an existing name replaces its factory.
/// Built-in keys cannot be overridden.
pub struct OperatorRegistry<P> {
    reserved: &'static [&'static str],
    ops: DashMap<String, OperatorFactory<P>>,
}

/// Registry for custom restrictor keys
pub type EntityRestrictorOps = OperatorRegistry<EntityPredicate>;

/// Registry for custom condition keys
pub type CheckOps = OperatorRegistry<CheckPredicate>;

impl<P> OperatorRegistry<P> {
    fn with_reserved(reserved: &'static [&'static str]) -> Self {
        Self {
            reserved,
            ops: DashMap::new(),
        }
    }

    /// Register (or replace) an operator
    pub fn insert<F>(&self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<P> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.reserved.contains(&name.as_str()) {
            return Err(AuthzError::InvalidInput(format!(
                "'{}' is a built-in operator and cannot be overridden",
                name
            )));
        }

        self.ops.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Register several operators at once
    ///
    /// Stops at the first reserved name; operators before it stay registered.
    pub fn extend<I>(&self, ops: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, OperatorFactory<P>)>,
    {
        for (name, factory) in ops {
            if self.reserved.contains(&name.as_str()) {
                return Err(AuthzError::InvalidInput(format!(
                    "'{}' is a built-in operator and cannot be overridden",
                    name
                )));
            }
            self.ops.insert(name, factory);
        }
        Ok(())
    }

    /// Compile `name` with `arg`, failing with `UnknownOperator` if unregistered
    pub fn build(&self, name: &str, arg: &Value) -> Result<P> {
        // Release the shard lock before running user code
        let factory = self
            .ops
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AuthzError::UnknownOperator(name.to_string()))?;

        factory(arg)
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Number of registered operators
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no operators are registered
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl OperatorRegistry<EntityPredicate> {
    /// Create an empty restrictor registry
    pub fn new() -> Self {
        Self::with_reserved(RESTRICTOR_BUILTINS)
    }

    /// Process-wide restrictor registry
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<EntityRestrictorOps>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }
}

impl Default for OperatorRegistry<EntityPredicate> {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorRegistry<CheckPredicate> {
    /// Create an empty check registry
    pub fn new() -> Self {
        Self::with_reserved(CHECK_BUILTINS)
    }

    /// Process-wide check registry
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<CheckOps>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new())))
    }
}

impl Default for OperatorRegistry<CheckPredicate> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::constant;
    use serde_json::json;

    #[tokio::test]
    async fn test_build_registered_operator() {
        let ops = CheckOps::new();
        ops.insert("always", |arg: &Value| Ok(constant(arg.as_bool().unwrap_or(false))))
            .unwrap();

        assert!(ops.contains("always"));
        let p = ops.build("always", &json!(true)).unwrap();
        let ctx = crate::types::CheckPermContext::new(
            crate::types::EntityId::new(),
            "read",
            crate::types::ResourceId::new(),
        );
        assert!(p(Arc::new(ctx)).await.unwrap());
    }

    #[test]
    fn test_unknown_operator() {
        let ops = EntityRestrictorOps::new();
        let err = ops.build("nope", &Value::Null).err().unwrap();
        assert!(matches!(err, AuthzError::UnknownOperator(name) if name == "nope"));
    }

    #[test]
    fn test_builtins_are_reserved() {
        let ops = EntityRestrictorOps::new();
        assert!(ops.insert("subof", |_: &Value| Ok(constant(true))).is_err());

        let ops = CheckOps::new();
        assert!(ops.insert("and", |_: &Value| Ok(constant(true))).is_err());
        assert!(ops.is_empty());
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let ops = EntityRestrictorOps::new();
        ops.insert("flag", |_: &Value| Ok(constant(true))).unwrap();
        ops.insert("flag", |_: &Value| Ok(constant(false))).unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_factory_errors_propagate() {
        let ops = EntityRestrictorOps::new();
        ops.insert("strict", |arg: &Value| {
            arg.as_str()
                .map(|_| constant(true))
                .ok_or_else(|| AuthzError::InvalidPolicy("strict expects a string".to_string()))
        })
        .unwrap();

        assert!(matches!(
            ops.build("strict", &json!(3)),
            Err(AuthzError::InvalidPolicy(_))
        ));
    }
}
