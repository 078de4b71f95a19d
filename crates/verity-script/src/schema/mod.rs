//! Schema definitions for RON inputs

pub mod metamodel;
pub mod model;
pub mod script;
