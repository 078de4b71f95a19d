//! Metamodel schema: element kinds and their properties

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use verity_core::{Element, KindId, Model, Value};

/// Definition of an element kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindDef {
    /// Kind identifier, as used by elements and constraint contexts
    pub id: KindId,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Property schemas for this kind
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    /// Parent kind (its properties are inherited)
    #[serde(default)]
    pub extends: Option<KindId>,
}

/// Definition of a property on an element kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name
    pub name: String,
    /// Property type
    pub property_type: PropertyType,
    /// Whether elements must carry this property
    #[serde(default)]
    pub required: bool,
}

/// Property type enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyType {
    Any,
    Bool,
    Int,
    Float,
    String,
    ElementRef,
    List(Box<PropertyType>),
    Map,
}

impl PropertyType {
    /// Whether a value conforms to this type (null always does)
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (PropertyType::Any, _) => true,
            (PropertyType::Bool, Value::Bool(_)) => true,
            (PropertyType::Int, Value::Int(_)) => true,
            (PropertyType::Float, Value::Float(_) | Value::Int(_)) => true,
            (PropertyType::String, Value::String(_)) => true,
            (PropertyType::ElementRef, Value::ElementRef(_)) => true,
            (PropertyType::List(inner), Value::List(items)) => items.iter().all(|v| inner.accepts(v)),
            (PropertyType::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

impl KindDef {
    /// Create a new kind definition
    pub fn new(id: impl Into<KindId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            properties: Vec::new(),
            extends: None,
        }
    }

    /// Add a property definition
    pub fn with_property(mut self, prop: PropertyDef) -> Self {
        self.properties.push(prop);
        self
    }

    /// Set the parent kind
    pub fn extending(mut self, parent: impl Into<KindId>) -> Self {
        self.extends = Some(parent.into());
        self
    }
}

impl PropertyDef {
    /// Create an optional property of the given type
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            required: false,
        }
    }

    /// Make this property required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A collection of kind definitions a model is checked against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metamodel {
    pub kinds: Vec<KindDef>,
}

impl Metamodel {
    /// Get a kind definition
    pub fn kind(&self, id: &KindId) -> Option<&KindDef> {
        self.kinds.iter().find(|k| &k.id == id)
    }

    /// Properties of a kind including inherited ones, nearest definition first
    pub fn properties_of(&self, id: &KindId) -> Vec<&PropertyDef> {
        let mut props: Vec<&PropertyDef> = Vec::new();
        let mut current = self.kind(id);
        // Bounded walk so a cyclic `extends` chain cannot loop forever
        for _ in 0..=self.kinds.len() {
            let Some(kind) = current else { break };
            for prop in &kind.properties {
                if !props.iter().any(|p| p.name == prop.name) {
                    props.push(prop);
                }
            }
            current = kind.extends.as_ref().and_then(|parent| self.kind(parent));
        }
        props
    }

    /// Check that every element of a model uses a declared kind, carries the
    /// required properties and holds well-typed values
    pub fn check(&self, model: &Model) -> Result<()> {
        for element in model.elements.iter() {
            self.check_element(model, element)?;
        }
        Ok(())
    }

    fn check_element(&self, model: &Model, element: &Element) -> Result<()> {
        let nonconforming = |reason: String| Error::Nonconforming {
            model: model.name.clone(),
            reason,
        };
        if self.kind(&element.kind).is_none() {
            return Err(nonconforming(format!(
                "{} has undeclared kind {}",
                element.id, element.kind
            )));
        }
        for prop in self.properties_of(&element.kind) {
            match element.get(&prop.name) {
                None | Some(Value::Null) if prop.required => {
                    return Err(nonconforming(format!(
                        "{} is missing required property {}",
                        element.id, prop.name
                    )))
                }
                Some(value) if !prop.property_type.accepts(value) => {
                    return Err(nonconforming(format!(
                        "{} property {} expected {:?}, got {}",
                        element.id,
                        prop.name,
                        prop.property_type,
                        value.type_name()
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}
