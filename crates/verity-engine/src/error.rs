//! Error types for verity-engine
//!
//! Configuration errors (`DependencyCycle`, `UnknownDependency`,
//! `NestedParallelism`) are raised before any job runs. `TaskPanicked` and any
//! other error returned from a pooled task are parallel-phase fatal errors.
//! Evaluation failures inside a single check never surface here; they become
//! errored unsatisfied constraints.

use std::fmt;
use thiserror::Error;
use verity_core::SourceLocation;

/// Result type for verity-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// A constraint taking part in a dependency cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleMember {
    /// Qualified constraint name
    pub name: String,
    /// Declaration site
    pub location: SourceLocation,
}

impl fmt::Display for CycleMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.location)
    }
}

/// Errors that can occur in verity-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Constraint dependencies form a cycle
    #[error("constraint dependency cycle: {}", Self::format_members(.members))]
    DependencyCycle {
        /// Constraints on the cycle, in dependency order
        members: Vec<CycleMember>,
    },

    /// A constraint depends on a name that resolves to nothing
    #[error("constraint {constraint} at {location} depends on unknown constraint {dependency}")]
    UnknownDependency {
        constraint: String,
        dependency: String,
        location: SourceLocation,
    },

    /// Parallel dispatch attempted from a pool worker thread
    #[error("nested parallel execution from a pool worker thread is not allowed")]
    NestedParallelism,

    /// Operation not valid in the current execution phase
    #[error("invalid execution state: {0}")]
    InvalidState(String),

    /// The thread pool could not be created
    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),

    /// A pooled task panicked
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// A job does not resolve against the loaded script and models
    #[error("job cannot be resolved: {0}")]
    JobNotResolvable(String),

    /// A batch range does not fit the job list
    #[error("batch [{from}, {to}) is out of range for {len} jobs")]
    BatchOutOfRange { from: usize, to: usize, len: usize },

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] verity_core::Error),
}

impl Error {
    /// Whether this error is a configuration error (never retried)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DependencyCycle { .. }
                | Error::UnknownDependency { .. }
                | Error::NestedParallelism
        )
    }

    fn format_members(members: &[CycleMember]) -> String {
        members
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

// Compile-time check that Error is Send + Sync for thread-safe error propagation.
// This function is never called but will fail to compile if the bound is not satisfied.
fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
}
