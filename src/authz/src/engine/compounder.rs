//! Reaction compounding strategies
//!
//! A compounder folds the per-policy reactions of one check into a verdict.
//! Depending on its [`InvocationMode`] it is called after every policy, once
//! after the last policy, or both.

use crate::error::{AuthzError, Result};
use crate::policy::{Policy, Reaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When the engine calls a compounder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// After every policy
    Each,
    /// Once, after the last policy
    Conclude,
    /// After every policy and once more at the end
    All,
}

impl InvocationMode {
    /// Whether the compounder runs after every policy
    pub fn per_policy(self) -> bool {
        matches!(self, InvocationMode::Each | InvocationMode::All)
    }

    /// Whether the compounder runs after the last policy
    pub fn at_end(self) -> bool {
        matches!(self, InvocationMode::Conclude | InvocationMode::All)
    }
}

/// Result of one compounder call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundStep {
    /// Stop with this verdict
    Conclude(bool),
    /// Keep going
    Continue,
}

/// Snapshot handed to a compounder
#[derive(Debug, Clone, Copy)]
pub struct CompoundInput<'a> {
    /// Every candidate policy, in evaluation order
    pub policies: &'a [Policy],

    /// Reactions so far, including the current one
    pub reactions: &'a [Reaction],

    /// Index of the policy just evaluated; equals `policies.len()` on the final call
    pub index: usize,

    /// Reaction of the policy just evaluated (`None` on the final call)
    pub current: Reaction,
}

impl CompoundInput<'_> {
    /// Whether this is the concluding call after the last policy
    pub fn is_final(&self) -> bool {
        self.index >= self.policies.len()
    }

    /// Whether any reaction so far is a deny
    pub fn any_denied(&self) -> bool {
        self.reactions.contains(&Some(false))
    }

    /// Whether any reaction so far is an allow
    pub fn any_allowed(&self) -> bool {
        self.reactions.contains(&Some(true))
    }
}

/// Folds policy reactions into one verdict
pub trait Compounder: Send + Sync {
    /// When the engine calls [`compound`](Self::compound)
    fn mode(&self) -> InvocationMode;

    /// Conclude or continue
    fn compound(&self, input: &CompoundInput<'_>) -> Result<CompoundStep>;
}

/// Default strategy: any deny wins, then any allow, otherwise no decision
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyOverrides;

impl Compounder for DenyOverrides {
    fn mode(&self) -> InvocationMode {
        InvocationMode::All
    }

    fn compound(&self, input: &CompoundInput<'_>) -> Result<CompoundStep> {
        if input.current == Some(false) || input.any_denied() {
            return Ok(CompoundStep::Conclude(false));
        }

        if !input.is_final() {
            return Ok(CompoundStep::Continue);
        }

        if input.any_allowed() {
            Ok(CompoundStep::Conclude(true))
        } else {
            Err(AuthzError::NoDecision)
        }
    }
}

/// The first policy that does not abstain decides
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstApplicable;

impl Compounder for FirstApplicable {
    fn mode(&self) -> InvocationMode {
        InvocationMode::Each
    }

    fn compound(&self, input: &CompoundInput<'_>) -> Result<CompoundStep> {
        Ok(match input.current {
            Some(verdict) => CompoundStep::Conclude(verdict),
            None => CompoundStep::Continue,
        })
    }
}

/// Compounder backed by a closure
pub struct FnCompounder<F> {
    mode: InvocationMode,
    f: F,
}

impl<F> FnCompounder<F>
where
    F: Fn(&CompoundInput<'_>) -> Result<CompoundStep> + Send + Sync,
{
    /// Wrap `f`, called according to `mode`
    pub fn new(mode: InvocationMode, f: F) -> Self {
        Self { mode, f }
    }
}

impl<F> Compounder for FnCompounder<F>
where
    F: Fn(&CompoundInput<'_>) -> Result<CompoundStep> + Send + Sync,
{
    fn mode(&self) -> InvocationMode {
        self.mode
    }

    fn compound(&self, input: &CompoundInput<'_>) -> Result<CompoundStep> {
        (self.f)(input)
    }
}

/// Built-in strategies by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompounderKind {
    /// [`DenyOverrides`]
    #[default]
    DenyOverrides,
    /// [`FirstApplicable`]
    FirstApplicable,
}

impl CompounderKind {
    /// Strategy instance for this kind
    pub fn compounder(self) -> &'static dyn Compounder {
        match self {
            CompounderKind::DenyOverrides => &DenyOverrides,
            CompounderKind::FirstApplicable => &FirstApplicable,
        }
    }
}

impl fmt::Display for CompounderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompounderKind::DenyOverrides => write!(f, "deny-overrides"),
            CompounderKind::FirstApplicable => write!(f, "first-applicable"),
        }
    }
}

impl FromStr for CompounderKind {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deny-overrides" => Ok(CompounderKind::DenyOverrides),
            "first-applicable" => Ok(CompounderKind::FirstApplicable),
            other => Err(AuthzError::InvalidInput(format!("unknown compounder: {}", other))),
        }
    }
}
