//! Error types for verity-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Duplicate element: {0}")]
    DuplicateElement(String),

    #[error("Duplicate model: {0}")]
    DuplicateModel(String),

    #[error("Duplicate constraint {name} in context {context}")]
    DuplicateConstraint { context: String, name: String },

    #[error("Unknown constraint: {0}")]
    UnknownConstraint(String),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Evaluation error: {0}")]
    EvaluationError(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
