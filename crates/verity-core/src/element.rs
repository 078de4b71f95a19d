//! Model elements and their per-model storage

use crate::{ElementId, Error, KindId, Result, Value, ValueMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single model element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    /// Identifier, unique within the owning model
    pub id: ElementId,
    /// The kind of this element (what constraint contexts bind to)
    pub kind: KindId,
    /// Dynamic properties (e.g., {"name": "Ann", "age": 41})
    #[serde(default)]
    pub properties: ValueMap,
}

impl Element {
    /// Create a new element with no properties
    pub fn new(id: ElementId, kind: impl Into<KindId>) -> Self {
        Self {
            id,
            kind: kind.into(),
            properties: ValueMap::new(),
        }
    }

    /// Builder-style property setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a property value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Get a property value or a default
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.properties.get(key).cloned().unwrap_or(default)
    }

    /// Set a property value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Remove a property
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.properties.shift_remove(key)
    }

    /// Get a numeric property as f64
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(|v| v.as_number())
    }
}

/// Storage for the elements of one model
///
/// Iteration order is insertion order, which is what job enumeration relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementStore {
    /// All elements by ID
    elements: IndexMap<ElementId, Element>,
    /// Next element ID to assign
    next_id: u64,
    /// Index: kind -> element IDs
    by_kind: IndexMap<KindId, Vec<ElementId>>,
}

impl ElementStore {
    /// Create a new empty element store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new element with a fresh ID and add it to the store
    pub fn create(&mut self, kind: impl Into<KindId>) -> &mut Element {
        let id = ElementId::new(self.next_id);
        self.next_id += 1;
        let kind = kind.into();

        self.by_kind.entry(kind.clone()).or_default().push(id);
        self.elements.entry(id).or_insert(Element::new(id, kind))
    }

    /// Insert an element with an explicit ID
    ///
    /// Fails if the ID is already taken.
    pub fn insert(&mut self, element: Element) -> Result<()> {
        if self.elements.contains_key(&element.id) {
            return Err(Error::DuplicateElement(element.id.to_string()));
        }
        self.next_id = self.next_id.max(element.id.raw() + 1);
        self.by_kind
            .entry(element.kind.clone())
            .or_default()
            .push(element.id);
        self.elements.insert(element.id, element);
        Ok(())
    }

    /// Get an element by ID
    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    /// Get a mutable reference to an element
    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(&id)
    }

    /// Get all elements of a given kind, in insertion order
    pub fn of_kind<'a>(&'a self, kind: &KindId) -> impl Iterator<Item = &'a Element> + 'a {
        self.by_kind
            .get(kind)
            .into_iter()
            .flat_map(|ids| ids.iter().filter_map(|id| self.elements.get(id)))
    }

    /// Get all kinds present in the store
    pub fn kinds(&self) -> impl Iterator<Item = &KindId> {
        self.by_kind.keys()
    }

    /// Get all elements
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    /// Get the number of elements
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element() {
        let element = Element::new(ElementId::new(1), "Person")
            .with("name", "Ann")
            .with("age", 41i64);

        assert_eq!(element.get_number("age"), Some(41.0));
        assert_eq!(element.get("name").and_then(|v| v.as_str()), Some("Ann"));
        assert_eq!(element.get_or("missing", Value::Int(0)), Value::Int(0));
    }

    #[test]
    fn test_element_store() {
        let mut store = ElementStore::new();

        store.create("Person").set("name", "Ann");
        store.create("Person").set("name", "Bob");
        store.create("Company").set("name", "Acme");

        assert_eq!(store.len(), 3);
        assert_eq!(store.of_kind(&KindId::new("Person")).count(), 2);
        assert_eq!(store.of_kind(&KindId::new("Company")).count(), 1);
        assert_eq!(store.of_kind(&KindId::new("Missing")).count(), 0);
    }

    #[test]
    fn test_insert_preserves_order_and_advances_ids() {
        let mut store = ElementStore::new();
        store.insert(Element::new(ElementId::new(7), "Person")).unwrap();
        store.insert(Element::new(ElementId::new(2), "Person")).unwrap();

        let ids: Vec<_> = store
            .of_kind(&KindId::new("Person"))
            .map(|e| e.id.raw())
            .collect();
        assert_eq!(ids, vec![7, 2], "kind index keeps insertion order");

        let created = store.create("Person").id;
        assert_eq!(created, ElementId::new(8));
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let mut store = ElementStore::new();
        store.insert(Element::new(ElementId::new(1), "Person")).unwrap();
        let err = store
            .insert(Element::new(ElementId::new(1), "Person"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateElement(_)));
    }
}
