//! # IPermit Authorization Engine
//!
//! Embeddable permission engine: given a requester, an access action and a
//! target resource, decides allow or deny.
//!
//! ## Features
//!
//! - **Entity inheritance graph** with cycle-safe ancestor resolution
//! - **Condition compiler** turning JSON condition trees into async predicates
//! - **Extensible operators** for restrictors and conditions
//! - **Priority-ordered evaluation** with pluggable reaction compounding
//! - **In-memory and PostgreSQL stores** (`postgres` feature)
//! - **LRU memoization** of ancestor closures and compiled checks
//!
//! ## Example
//!
//! ```rust
//! use ipermit_authz::{
//!     CheckPermRequest, ConditionTree, InMemoryStore, PermitEngine, Policy, PolicySelector, Resource, Restrictor,
//! };
//! use std::collections::HashSet;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = PermitEngine::new(Arc::new(InMemoryStore::new()));
//!
//!     let staff = engine.create_entity(HashSet::new()).await?;
//!     let alice = engine.create_entity(HashSet::from([staff.id])).await?;
//!
//!     let report = Resource::new().of_type("document");
//!     engine.upsert_resource(report.clone()).await?;
//!
//!     engine
//!         .upsert_policy(
//!             Policy::new()
//!                 .with_selector(PolicySelector::resource_type("document"))
//!                 .with_content(
//!                     ConditionTree::new()
//!                         .access("read")
//!                         .requester(Restrictor::sub_of(staff.id)),
//!                     Some(true),
//!                 ),
//!         )
//!         .await?;
//!
//!     let allowed = engine
//!         .check_perm(CheckPermRequest::new(alice.id, "read", report.id))
//!         .await?;
//!
//!     if allowed {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod policy;
pub mod predicate;
pub mod registry;
pub mod relevance;
pub mod restrictor;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use check::{CheckCompiler, Condition, ConditionTree};
pub use config::{CacheConfig, DataProvider, PermitConfig};
pub use engine::{
    CompoundInput, CompoundStep, Compounder, CompounderKind, DenyOverrides, FirstApplicable, FnCompounder,
    InvocationMode, PermitEngine,
};
pub use error::{AuthzError, Result};
pub use graph::EntityGraph;
pub use policy::{Policy, PolicyContent, PolicySelector, Reaction, SelectorMatch};
pub use predicate::{CheckPredicate, EntityPredicate, Predicate};
pub use registry::{CheckOps, EntityRestrictorOps, OperatorFactory};
pub use relevance::{PolicyFilter, RelevanceFilter};
pub use restrictor::{Restrictor, RestrictorClause, RestrictorCompiler};
pub use store::{EntityStore, InMemoryStore, PolicyStore, ResourceStore, Snapshot};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use types::{
    Access, CheckPermContext, CheckPermRequest, Entity, EntityId, PolicyId, Resource, ResourceId, ResourceRef,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
