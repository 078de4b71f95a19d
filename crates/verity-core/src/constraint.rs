//! Constraints, constraint contexts and the script that owns them
//!
//! A [`Script`] is the in-memory form of a validation script: an ordered list
//! of [`ConstraintContext`]s, each binding to one element kind and owning an
//! ordered list of [`Constraint`]s. Declaration order matters everywhere
//! downstream (job enumeration, scheduling tie-breaks), so contexts and
//! constraints are kept in plain vectors and addressed by [`ConstraintId`].

use crate::{Error, Expr, KindId, Result, ValueMap};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a constraint in its script: context index, then constraint index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstraintId {
    /// Index of the owning context in declaration order
    pub context: usize,
    /// Index of the constraint within its context
    pub constraint: usize,
}

impl ConstraintId {
    /// Create a new constraint ID
    pub fn new(context: usize, constraint: usize) -> Self {
        Self {
            context,
            constraint,
        }
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constraint({}, {})", self.context, self.constraint)
    }
}

/// Where a context or constraint was declared
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Script origin (usually the file path)
    pub origin: String,
    /// Context index in the script
    pub context: usize,
    /// Constraint index in the context, if this locates a constraint
    pub constraint: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constraint {
            Some(c) => write!(
                f,
                "{}: contexts[{}].constraints[{}]",
                self.origin, self.context, c
            ),
            None => write!(f, "{}: contexts[{}]", self.origin, self.context),
        }
    }
}

/// An action applied to an element when its constraint is unsatisfied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FixAction {
    /// Set a property to the value of an expression evaluated on the element
    SetProperty {
        /// Property to write
        property: String,
        /// Value to write
        value: Expr,
    },
    /// Remove a property from the element
    RemoveProperty(String),
}

/// A repair attached to a constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Human readable title
    #[serde(default)]
    pub title: Option<Expr>,
    /// Actions, applied in order
    pub actions: Vec<FixAction>,
}

/// A named boolean check over one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Name, unique within the owning context
    pub name: String,
    /// The check; a truthy result means satisfied
    pub check: Expr,
    /// Optional per-element guard; when false the constraint does not apply
    #[serde(default)]
    pub guard: Option<Expr>,
    /// Optional message rendered for unsatisfied elements
    #[serde(default)]
    pub message: Option<Expr>,
    /// Optional repair
    #[serde(default)]
    pub fix: Option<Fix>,
    /// Lazy constraints are only evaluated when another constraint asks for them
    #[serde(default)]
    pub lazy: bool,
    /// Constraints that must be checked before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declaration site
    #[serde(skip)]
    pub location: SourceLocation,
}

impl Constraint {
    /// Create a constraint with just a name and a check
    pub fn new(name: impl Into<String>, check: Expr) -> Self {
        Self {
            name: name.into(),
            check,
            guard: None,
            message: None,
            fix: None,
            lazy: false,
            depends_on: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    /// Set the per-element guard
    pub fn with_guard(mut self, guard: Expr) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Set the message expression
    pub fn with_message(mut self, message: Expr) -> Self {
        self.message = Some(message);
        self
    }

    /// Set the fix
    pub fn with_fix(mut self, fix: Fix) -> Self {
        self.fix = Some(fix);
        self
    }

    /// Mark the constraint lazy
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Declare an explicit dependency
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Every constraint this one depends on: explicit declarations first, then
    /// `Satisfies` references in the guard, check and message (deduplicated)
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        let implicit = self
            .guard
            .iter()
            .chain(std::iter::once(&self.check))
            .chain(self.message.iter())
            .flat_map(|e| e.referenced_constraints());
        for name in self.depends_on.iter().map(String::as_str).chain(implicit) {
            if !deps.contains(&name) {
                deps.push(name);
            }
        }
        deps
    }
}

/// Constraints applicable to one element kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintContext {
    /// Context name; used to qualify constraint names (`"Context.Constraint"`)
    pub name: String,
    /// Bound element kind, or `None` for a global context
    #[serde(default)]
    pub kind: Option<KindId>,
    /// Optional applicability guard evaluated per element during enumeration
    #[serde(default)]
    pub guard: Option<Expr>,
    /// Constraints in declaration order
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Declaration site
    #[serde(skip)]
    pub location: SourceLocation,
}

impl ConstraintContext {
    /// Create a context bound to an element kind, named after the kind
    pub fn new(kind: impl Into<KindId>) -> Self {
        let kind = kind.into();
        Self {
            name: kind.to_string(),
            kind: Some(kind),
            guard: None,
            constraints: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    /// Create a global context that is not bound to any element kind
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            guard: None,
            constraints: Vec::new(),
            location: SourceLocation::default(),
        }
    }

    /// Set the applicability guard
    pub fn with_guard(mut self, guard: Expr) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Append a constraint
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Find a constraint by name
    pub fn constraint(&self, name: &str) -> Option<(usize, &Constraint)> {
        self.constraints
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    /// Whether this context is global (bound to no kind)
    pub fn is_global(&self) -> bool {
        self.kind.is_none()
    }
}

/// A validation script: contexts plus declared variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Where the script came from
    #[serde(default)]
    pub origin: String,
    /// Declared variables with their default values
    #[serde(default)]
    pub variables: ValueMap,
    /// Contexts in declaration order
    #[serde(default)]
    pub contexts: Vec<ConstraintContext>,
}

impl Script {
    /// Create an empty script
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            variables: ValueMap::new(),
            contexts: Vec::new(),
        }
    }

    /// Append a context
    pub fn with_context(mut self, context: ConstraintContext) -> Self {
        self.contexts.push(context);
        self.locate();
        self
    }

    /// Declare a variable with its default value
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Stamp every context and constraint with its source location
    pub fn locate(&mut self) {
        for (ci, context) in self.contexts.iter_mut().enumerate() {
            context.location = SourceLocation {
                origin: self.origin.clone(),
                context: ci,
                constraint: None,
            };
            for (ki, constraint) in context.constraints.iter_mut().enumerate() {
                constraint.location = SourceLocation {
                    origin: self.origin.clone(),
                    context: ci,
                    constraint: Some(ki),
                };
            }
        }
    }

    /// Check structural invariants: non-empty names, names unique per context
    pub fn validate(&self) -> Result<()> {
        for context in &self.contexts {
            if context.name.is_empty() {
                return Err(Error::InvalidScript(format!(
                    "context at {} has an empty name",
                    context.location
                )));
            }
            for (i, constraint) in context.constraints.iter().enumerate() {
                if constraint.name.is_empty() {
                    return Err(Error::InvalidScript(format!(
                        "constraint at {} has an empty name",
                        constraint.location
                    )));
                }
                if context.constraints[..i]
                    .iter()
                    .any(|c| c.name == constraint.name)
                {
                    return Err(Error::DuplicateConstraint {
                        context: context.name.clone(),
                        name: constraint.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Get a constraint by ID
    pub fn constraint(&self, id: ConstraintId) -> Option<&Constraint> {
        self.contexts
            .get(id.context)
            .and_then(|c| c.constraints.get(id.constraint))
    }

    /// Total number of constraints
    pub fn constraint_count(&self) -> usize {
        self.contexts.iter().map(|c| c.constraints.len()).sum()
    }

    /// All constraints in declaration order
    pub fn constraints(&self) -> impl Iterator<Item = (ConstraintId, &Constraint)> {
        self.contexts.iter().enumerate().flat_map(|(ci, context)| {
            context
                .constraints
                .iter()
                .enumerate()
                .map(move |(ki, c)| (ConstraintId::new(ci, ki), c))
        })
    }

    /// Qualified name (`"Context.Constraint"`) of a constraint
    pub fn qualified_name(&self, id: ConstraintId) -> Option<String> {
        let context = self.contexts.get(id.context)?;
        let constraint = context.constraints.get(id.constraint)?;
        Some(format!("{}.{}", context.name, constraint.name))
    }

    /// Resolve a constraint reference as seen from a context
    ///
    /// Qualified names (`"Context.Constraint"`) resolve directly. Plain names
    /// resolve within `from` first, then in declaration order across the script.
    pub fn resolve(&self, reference: &str, from: usize) -> Option<ConstraintId> {
        if let Some((context_name, name)) = reference.split_once('.') {
            return self
                .contexts
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name == context_name)
                .find_map(|(ci, c)| c.constraint(name).map(|(ki, _)| ConstraintId::new(ci, ki)));
        }
        if let Some((ki, _)) = self.contexts.get(from).and_then(|c| c.constraint(reference)) {
            return Some(ConstraintId::new(from, ki));
        }
        self.contexts
            .iter()
            .enumerate()
            .find_map(|(ci, c)| c.constraint(reference).map(|(ki, _)| ConstraintId::new(ci, ki)))
    }

    /// Find a context by name
    pub fn context_index(&self, name: &str) -> Option<usize> {
        self.contexts.iter().position(|c| c.name == name)
    }
}
