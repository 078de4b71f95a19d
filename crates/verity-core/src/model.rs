//! Models and the repository of models a validation run reads from
//!
//! A run validates one or more named models. Elements are addressed across
//! the repository with an [`ElementRef`] (model name plus element ID), which
//! is also the element reference carried by every unsatisfied constraint.

use crate::{Element, ElementId, ElementStore, Error, KindId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Repository-wide reference to a model element
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementRef {
    /// Name of the model holding the element
    pub model: String,
    /// Element ID within that model
    pub element: ElementId,
}

impl ElementRef {
    /// Create a new element reference
    pub fn new(model: impl Into<String>, element: ElementId) -> Self {
        Self {
            model: model.into(),
            element,
        }
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.model, self.element)
    }
}

/// A named model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    /// Model name (unique within a repository)
    pub name: String,
    /// The elements of this model
    pub elements: ElementStore,
}

impl Model {
    /// Create a new empty model
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: ElementStore::new(),
        }
    }

    /// Build a reference to one of this model's elements
    pub fn reference(&self, element: ElementId) -> ElementRef {
        ElementRef::new(self.name.clone(), element)
    }
}

/// The set of models visible to a validation run
///
/// Models are kept in the order they were added; enumeration over kinds
/// visits models in that order.
#[derive(Debug, Clone, Default)]
pub struct ModelRepository {
    models: Vec<Model>,
}

impl ModelRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model, rejecting duplicate names
    pub fn add(&mut self, model: Model) -> Result<()> {
        if self.models.iter().any(|m| m.name == model.name) {
            return Err(Error::DuplicateModel(model.name));
        }
        self.models.push(model);
        Ok(())
    }

    /// Builder-style variant of [`ModelRepository::add`]
    pub fn with_model(mut self, model: Model) -> Result<Self> {
        self.add(model)?;
        Ok(self)
    }

    /// All models, in insertion order
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    /// Look up a model by name
    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Look up a model by name, mutably
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Model> {
        self.models.iter_mut().find(|m| m.name == name)
    }

    /// Index of a model by name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|m| m.name == name)
    }

    /// Resolve an element reference
    pub fn resolve(&self, reference: &ElementRef) -> Option<&Element> {
        self.get(&reference.model)
            .and_then(|m| m.elements.get(reference.element))
    }

    /// Resolve an element reference mutably
    pub fn resolve_mut(&mut self, reference: &ElementRef) -> Option<&mut Element> {
        self.get_mut(&reference.model)
            .and_then(|m| m.elements.get_mut(reference.element))
    }

    /// All elements of a kind across every model, with the model they belong to
    pub fn of_kind<'a>(
        &'a self,
        kind: &'a KindId,
    ) -> impl Iterator<Item = (&'a Model, &'a Element)> + 'a {
        self.models
            .iter()
            .flat_map(move |m| m.elements.of_kind(kind).map(move |e| (m, e)))
    }

    /// Number of elements of a kind across every model
    pub fn count_of_kind(&self, kind: &KindId) -> usize {
        self.models
            .iter()
            .map(|m| m.elements.of_kind(kind).count())
            .sum()
    }

    /// Number of models
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Check if the repository holds no models
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
