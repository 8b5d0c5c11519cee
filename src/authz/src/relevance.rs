//! Candidate policy selection
//!
//! A policy is relevant to a resource when its selector is `"*"`, when its
//! object selector accepts the resource's type and owner, or when the resource
//! lists the policy in its bound policies. [`PolicyFilter`] captures everything
//! needed to decide this without further I/O, so stores can apply it while
//! scanning (or translate it into a query).

use crate::error::Result;
use crate::graph::EntityGraph;
use crate::policy::{Policy, PolicySelector, SelectorMatch};
use crate::restrictor::{Restrictor, RestrictorClause};
use crate::store::PolicyStore;
use crate::types::{EntityId, PolicyId, Resource};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Owner half of a [`PolicyFilter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    /// The resource has no owner
    Unowned,

    /// The resource is owned
    Owned {
        /// Owning entity
        owner: EntityId,
        /// Owner plus all of its ancestors
        closure: HashSet<EntityId>,
    },
}

/// Relevance test for one resource
#[derive(Debug, Clone)]
pub struct PolicyFilter {
    /// Resource type
    pub resource_type: String,

    /// Resource owner and its ancestor closure
    pub owner: OwnerFilter,

    /// Policies bound to the resource
    pub bound_policies: HashSet<PolicyId>,
}

impl PolicyFilter {
    /// Build a filter for `resource`
    ///
    /// `owner_closure` holds the owner's ancestors; the owner itself is added
    /// if missing. It is ignored for owner-less resources.
    pub fn new(resource: &Resource, owner_closure: HashSet<EntityId>) -> Self {
        let owner = match resource.owner {
            Some(owner) => {
                let mut closure = owner_closure;
                closure.insert(owner);
                OwnerFilter::Owned { owner, closure }
            }
            None => OwnerFilter::Unowned,
        };

        Self {
            resource_type: resource.resource_type.clone(),
            owner,
            bound_policies: resource.bound_policies.clone(),
        }
    }

    /// Whether `policy` is a candidate for the resource
    pub fn matches(&self, policy: &Policy) -> bool {
        if self.bound_policies.contains(&policy.id) {
            return true;
        }

        match &policy.selector {
            None => false,
            Some(PolicySelector::Wildcard) => true,
            Some(PolicySelector::Match(selector)) => self.selector_matches(selector),
        }
    }

    fn selector_matches(&self, selector: &SelectorMatch) -> bool {
        let type_matches = match selector.resource_type.as_deref() {
            None | Some("*") => true,
            Some(t) => t == self.resource_type,
        };

        type_matches && self.owner_matches(selector.resource_owner.as_ref())
    }

    fn owner_matches(&self, restrictor: Option<&Restrictor>) -> bool {
        match (restrictor, &self.owner) {
            (None | Some(Restrictor::Wildcard), _) => true,
            (Some(Restrictor::NoOwner), owner) => *owner == OwnerFilter::Unowned,
            (Some(Restrictor::All(_)), OwnerFilter::Unowned) => false,
            (Some(Restrictor::All(clauses)), OwnerFilter::Owned { owner, closure }) => {
                clauses.iter().all(|clause| match clause {
                    RestrictorClause::Id(id) => id == owner,
                    RestrictorClause::SubOf(id) => closure.contains(id),
                    // Custom operators are not part of selection
                    RestrictorClause::Custom { .. } => true,
                })
            }
        }
    }
}

/// Fetches the candidate policies for a resource
pub struct RelevanceFilter {
    graph: Arc<EntityGraph>,
    policies: Arc<dyn PolicyStore>,
}

impl RelevanceFilter {
    /// Create a filter over the given graph and policy store
    pub fn new(graph: Arc<EntityGraph>, policies: Arc<dyn PolicyStore>) -> Self {
        Self { graph, policies }
    }

    /// Build the [`PolicyFilter`] for `resource`, resolving its owner's ancestors
    pub async fn filter_for(&self, resource: &Resource) -> Result<PolicyFilter> {
        let closure = match resource.owner {
            Some(owner) => self.graph.ascertain_ancestors(owner, true).await?,
            None => HashSet::new(),
        };

        Ok(PolicyFilter::new(resource, closure))
    }

    /// Relevant policies for `resource`, highest priority first
    ///
    /// Equal priorities keep the order in which the store returned them.
    pub async fn retrieve_relevant_policies(&self, resource: &Resource) -> Result<Vec<Policy>> {
        let filter = self.filter_for(resource).await?;
        let mut policies = self.policies.find_policies(&filter).await?;
        policies.sort_by_key(|p| Reverse(p.priority));

        debug!(
            "Found {} relevant policies for resource {} (type={})",
            policies.len(),
            resource.id,
            resource.resource_type
        );

        Ok(policies)
    }
}
