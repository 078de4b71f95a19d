//! Verity Script - RON loader and schema definitions
//!
//! Loads validation inputs from RON files:
//! - Constraint scripts (contexts, constraints, declared variables)
//! - Models (named element lists)
//! - Metamodels (element kinds with typed, optionally required properties)
//! - Script parameters given as `name=value` strings

mod error;
mod loader;
mod params;
mod schema;

pub use error::{Error, Result};
pub use loader::Loader;
pub use params::{parse_parameter, parse_parameters};
pub use schema::metamodel::{KindDef, Metamodel, PropertyDef, PropertyType};
pub use schema::model::ModelDef;
pub use schema::script::{ContextDef, ScriptDef};
