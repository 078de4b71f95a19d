//! Verity Core - Models, constraints and the expression engine
//!
//! This crate provides the data types every other verity crate builds on:
//! - Dynamic value types (`Value`, `ValueMap`)
//! - Element and kind identifiers
//! - Elements, models and the `ModelRepository` a run reads from
//! - Constraint scripts (`Script`, `ConstraintContext`, `Constraint`)
//! - The expression engine used by checks, guards, messages and fixes
//! - Recorded failures (`UnsatisfiedConstraint`)
//! - A deterministic RNG for reproducible job shuffling
//!
//! verity-core knows nothing about threads, workers or brokers. Evaluation
//! is pure, so the same script and model give the same answers wherever
//! they are evaluated.

mod constraint;
mod element;
mod error;
mod expr;
mod identity;
mod model;
mod rng;
mod unsatisfied;
mod value;

pub use constraint::{
    Constraint, ConstraintContext, ConstraintId, Fix, FixAction, Script, SourceLocation,
};
pub use element::{Element, ElementStore};
pub use error::{Error, Result};
pub use expr::{ConstraintOracle, EvalContext, Expr};
pub use identity::{ElementId, KindId};
pub use indexmap::{IndexMap, IndexSet};
pub use model::{ElementRef, Model, ModelRepository};
pub use rng::SeededRng;
pub use unsatisfied::{ConstraintKey, UnsatisfiedConstraint};
pub use value::{Value, ValueMap};
