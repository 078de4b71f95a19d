//! Error types for verity-script

use thiserror::Error;

/// Script loading error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Duplicate definition: {0}")]
    DuplicateDefinition(String),

    #[error("Malformed script parameter {0:?}: expected name=value")]
    MalformedParameter(String),

    #[error("Model {model} does not conform to its metamodel: {reason}")]
    Nonconforming { model: String, reason: String },

    #[error("Core error: {0}")]
    Core(#[from] verity_core::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
