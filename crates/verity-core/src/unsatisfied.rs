//! Recorded constraint failures

use crate::ElementRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Portable name of a constraint: context name plus constraint name
///
/// Uses names rather than script indices so results can be compared and
/// merged across processes that loaded the same script.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstraintKey {
    /// Name of the owning context
    pub context: String,
    /// Constraint name
    pub constraint: String,
}

impl ConstraintKey {
    /// Create a new constraint key
    pub fn new(context: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            constraint: constraint.into(),
        }
    }
}

impl fmt::Display for ConstraintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.context, self.constraint)
    }
}

/// A constraint that did not hold for an element
///
/// Equality is structural over every field, which is what the union merge
/// uses to suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnsatisfiedConstraint {
    /// The failed constraint
    pub constraint: ConstraintKey,
    /// The element it failed for; `None` for global constraints
    pub element: Option<ElementRef>,
    /// Rendered message
    pub message: String,
    /// True when the check raised an error instead of returning false
    #[serde(default)]
    pub errored: bool,
}

impl UnsatisfiedConstraint {
    /// Create a regular (non-errored) result
    pub fn new(
        constraint: ConstraintKey,
        element: Option<ElementRef>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            constraint,
            element,
            message: message.into(),
            errored: false,
        }
    }

    /// Create a result for a check that raised an error
    pub fn errored(
        constraint: ConstraintKey,
        element: Option<ElementRef>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            constraint,
            element,
            message: message.into(),
            errored: true,
        }
    }
}

impl fmt::Display for UnsatisfiedConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.element {
            Some(element) => write!(f, "[{}] {}: {}", self.constraint, element, self.message),
            None => write!(f, "[{}] {}", self.constraint, self.message),
        }
    }
}
