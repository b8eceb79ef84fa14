//! Rollout error types.

use thiserror::Error;

/// A label selector that could not be compiled.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("syntax error at offset {offset} in {input:?}: {message}")]
    Syntax {
        input: String,
        offset: usize,
        message: String,
    },

    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("invalid value {value:?} for label key {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("unknown selector operator {0:?}")]
    UnknownOperator(String),

    #[error("operator {operator} on key {key:?} requires at least one value")]
    MissingValues { key: String, operator: String },

    #[error("operator {operator} on key {key:?} takes no values")]
    UnexpectedValues { key: String, operator: String },

    #[error("label pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Errors that can occur while evaluating a target.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// The target's configuration cannot be evaluated.
    #[error("target {target}: {source}")]
    Configuration {
        target: String,
        #[source]
        source: SelectorError,
    },
}

impl RolloutError {
    /// Name of the target the error belongs to.
    pub fn target(&self) -> &str {
        match self {
            RolloutError::Configuration { target, .. } => target,
        }
    }
}
