//! Verity Engine - Scheduling and parallel execution of constraint checks
//!
//! This crate turns a loaded [`Script`](verity_core::Script) and
//! [`ModelRepository`](verity_core::ModelRepository) into a validation run.
//!
//! ## Architecture
//!
//! ```text
//! Validator
//!  │
//!  └── ExecutionContext (one per run)
//!       ├── ConstraintSchedule ← topological order, levels, depended-upon set
//!       ├── Vec<Job>           ← canonical (optionally shuffled) job list
//!       ├── rayon::ThreadPool  ← only during the parallel phase
//!       ├── ThreadLocalStore<LocalResults>
//!       └── ExceptionHandler   ← first fatal error, cancel flag
//! ```
//!
//! ## Key Components
//!
//! - [`enumerate_jobs`] and [`split_into_batches`]: pure functions every
//!   process agrees on, so work can be assigned by index range alone
//! - [`ConstraintSchedule`]: dependency order with cycle detection
//! - [`ExecutionContext`]: pool lifecycle, thread-local results and merging
//! - [`ExecutionStrategy`]: sequential, element-parallel,
//!   constraint-parallel and staged evaluation
//! - [`evaluate`]: run one batch and return its unsatisfied constraints
//! - [`apply_fixes`]: post-run repairs
//!
//! ## Determinism
//!
//! All strategies produce the same set of unsatisfied constraints for the
//! same inputs. Only the order of the merged list and the execution times
//! may vary between runs.

mod batch;
mod config;
mod context;
mod error;
mod evaluate;
mod exception;
mod fix;
pub mod hash;
mod job;
mod profiler;
mod scheduler;
mod strategy;
mod thread_local;
mod validator;

pub use batch::{split_into_batches, Batch};
pub use config::{hash_seed, max_cores, EngineConfig, DEFAULT_GLOBAL_SEED};
pub use context::{
    is_parallelisation_legal, ExecutionContext, LocalResults, MergeMode, Phase, TraceKey,
};
pub use error::{CycleMember, Error, Result};
pub use evaluate::{evaluate, evaluate_jobs, in_main_pass, run_job};
pub use exception::ExceptionHandler;
pub use fix::{apply_fixes, AppliedFix};
pub use job::{enumerate_jobs, shuffle_jobs, Job};
pub use profiler::Profiler;
pub use scheduler::ConstraintSchedule;
pub use strategy::ExecutionStrategy;
pub use thread_local::{ThreadLocalStore, WorkerKey};
pub use validator::{ValidationReport, Validator};
