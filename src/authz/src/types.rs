//! Core authorization types

use crate::error::{AuthzError, Result};
use crate::graph::EntityGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Underlying UUID
            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = AuthzError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| AuthzError::InvalidInput(format!("invalid {} id '{}': {}", $kind, s, e)))
            }
        }
    };
}

define_id!(
    /// Unique entity identifier
    EntityId,
    "entity"
);
define_id!(
    /// Unique resource identifier
    ResourceId,
    "resource"
);
define_id!(
    /// Unique policy identifier
    PolicyId,
    "policy"
);

/// Principal or group node in the inheritance graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier
    pub id: EntityId,

    /// Direct parents (groups this entity belongs to)
    #[serde(default)]
    pub parents: HashSet<EntityId>,

    /// Free-form properties, inspected by custom restrictor operators
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Entity {
    /// Create an entity with no parents
    pub fn new(id: EntityId) -> Self {
        Self::with_parents(id, [])
    }

    /// Create an entity with the given parents
    pub fn with_parents(id: EntityId, parents: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            id,
            parents: parents.into_iter().collect(),
            attributes: Map::new(),
        }
    }

    /// Set a free-form property
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a parent edge; returns `false` if it was already present
    pub fn add_parent(&mut self, parent: EntityId) -> bool {
        self.parents.insert(parent)
    }
}

fn default_resource_type() -> String {
    "default".to_string()
}

/// Object an access check targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource identifier
    pub id: ResourceId,

    /// Owning entity, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<EntityId>,

    /// Resource type (defaults to "default")
    #[serde(rename = "type", default = "default_resource_type")]
    pub resource_type: String,

    /// Policies explicitly bound to this resource
    #[serde(default)]
    pub bound_policies: HashSet<PolicyId>,

    /// Free-form properties, inspected by custom check operators
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Resource {
    /// Create an owner-less resource of the default type with a fresh id
    pub fn new() -> Self {
        Self::with_id(ResourceId::new())
    }

    /// Create an owner-less resource of the default type
    pub fn with_id(id: ResourceId) -> Self {
        Self {
            id,
            owner: None,
            resource_type: default_resource_type(),
            bound_policies: HashSet::new(),
            attributes: Map::new(),
        }
    }

    /// Set the owner
    pub fn owned_by(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the resource type
    pub fn of_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self
    }

    /// Bind a policy to this resource
    pub fn bind_policy(mut self, policy: PolicyId) -> Self {
        self.bound_policies.insert(policy);
        self
    }

    /// Set a free-form property
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::new()
    }
}

/// One access name or a set of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Access {
    /// Single access name (e.g. "read")
    One(String),
    /// Several access names
    Many(Vec<String>),
}

impl Access {
    /// All access names as a slice
    pub fn as_slice(&self) -> &[String] {
        match self {
            Access::One(name) => std::slice::from_ref(name),
            Access::Many(names) => names,
        }
    }

    /// Whether `name` is one of the access names
    pub fn contains(&self, name: &str) -> bool {
        self.as_slice().iter().any(|a| a == name)
    }

    /// Whether every access name here is also in `allowed`
    pub fn is_within(&self, allowed: &Access) -> bool {
        self.as_slice().iter().all(|a| allowed.contains(a))
    }
}

impl From<&str> for Access {
    fn from(name: &str) -> Self {
        Access::One(name.to_string())
    }
}

impl From<String> for Access {
    fn from(name: String) -> Self {
        Access::One(name)
    }
}

impl From<Vec<String>> for Access {
    fn from(names: Vec<String>) -> Self {
        Access::Many(names)
    }
}

impl From<Vec<&str>> for Access {
    fn from(names: Vec<&str>) -> Self {
        Access::Many(names.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Access {
    fn from(names: [&str; N]) -> Self {
        Access::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

/// A resource given either by id or as an already-loaded document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceRef {
    /// Resolved through the resource store
    Id(ResourceId),
    /// Used as given
    Resource(Resource),
}

impl ResourceRef {
    /// Identifier of the referenced resource
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceRef::Id(id) => *id,
            ResourceRef::Resource(resource) => resource.id,
        }
    }
}

impl From<ResourceId> for ResourceRef {
    fn from(id: ResourceId) -> Self {
        ResourceRef::Id(id)
    }
}

impl From<Resource> for ResourceRef {
    fn from(resource: Resource) -> Self {
        ResourceRef::Resource(resource)
    }
}

/// Permission check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckPermRequest {
    /// Who is making the request
    pub requester: EntityId,

    /// What access is requested
    pub access: Access,

    /// Which resource is targeted
    pub resource: ResourceRef,
}

impl CheckPermRequest {
    /// Create a new request
    pub fn new(requester: EntityId, access: impl Into<Access>, resource: impl Into<ResourceRef>) -> Self {
        Self {
            requester,
            access: access.into(),
            resource: resource.into(),
        }
    }
}

/// Per-call evaluation context handed to compiled checks
///
/// The requester entity is fetched lazily, at most once per context.
#[derive(Debug)]
pub struct CheckPermContext {
    /// Requesting entity
    pub requester: EntityId,

    /// Requested access
    pub access: Access,

    /// Target resource
    pub resource: ResourceId,

    requester_entity: OnceCell<Arc<Entity>>,
}

impl CheckPermContext {
    /// Create a new context
    pub fn new(requester: EntityId, access: impl Into<Access>, resource: ResourceId) -> Self {
        Self {
            requester,
            access: access.into(),
            resource,
            requester_entity: OnceCell::new(),
        }
    }

    /// Resolve the requester through `graph`, fetching it on first use
    pub async fn requester_entity(&self, graph: &EntityGraph) -> Result<Arc<Entity>> {
        self.requester_entity
            .get_or_try_init(|| async { graph.retrieve(self.requester).await.map(Arc::new) })
            .await
            .cloned()
    }
}
