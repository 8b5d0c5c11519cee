//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// A referenced entity, resource or policy is absent from persistence
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of document ("entity", "resource", "policy")
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Condition or restrictor key with no registered operator
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// Every candidate policy abstained (or there were none)
    #[error("No policy reacted; ensure at least one fallback policy is provided")]
    NoDecision,

    /// A compounder failed to conclude at a mandatory conclusion point
    #[error("Invalid compounder: {0}")]
    InvalidCompounder(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed policy, condition tree or restrictor
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Build a `NotFound` error for the given document kind
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
