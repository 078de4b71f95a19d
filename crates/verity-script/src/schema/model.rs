//! Model file schema

use serde::{Deserialize, Serialize};
use verity_core::Element;

/// A model as written in a RON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    /// Model name; defaults to the file stem when omitted
    #[serde(default)]
    pub name: Option<String>,
    /// Elements in model iteration order
    #[serde(default)]
    pub elements: Vec<Element>,
}
