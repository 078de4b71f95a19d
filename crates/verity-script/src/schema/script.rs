//! Constraint script schema

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use verity_core::{Constraint, ConstraintContext, Expr, KindId, Script, SourceLocation, ValueMap};

/// A constraint context as written in a script file
///
/// `name` defaults to the bound kind; a context with neither is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDef {
    /// Context name (defaults to the kind)
    #[serde(default)]
    pub name: Option<String>,
    /// Bound element kind; omit for a global context
    #[serde(default)]
    pub kind: Option<KindId>,
    /// Applicability guard
    #[serde(default)]
    pub guard: Option<Expr>,
    /// Constraints in declaration order
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// A whole script file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptDef {
    /// Declared variables with default values
    #[serde(default)]
    pub variables: ValueMap,
    /// Contexts in declaration order
    #[serde(default)]
    pub contexts: Vec<ContextDef>,
}

impl ScriptDef {
    /// Convert into a located, validated [`Script`]
    pub fn into_script(self, origin: impl Into<String>) -> Result<Script> {
        let mut script = Script::new(origin);
        script.variables = self.variables;
        for (i, def) in self.contexts.into_iter().enumerate() {
            let name = match (def.name, &def.kind) {
                (Some(name), _) => name,
                (None, Some(kind)) => kind.to_string(),
                (None, None) => {
                    return Err(Error::InvalidSchema(format!(
                        "{}: a global context needs a name",
                        SourceLocation {
                            origin: script.origin.clone(),
                            context: i,
                            constraint: None,
                        }
                    )))
                }
            };
            if script.contexts.iter().any(|c| c.name == name) {
                return Err(Error::DuplicateDefinition(format!("context {}", name)));
            }
            script.contexts.push(ConstraintContext {
                name,
                kind: def.kind,
                guard: def.guard,
                constraints: def.constraints,
                location: SourceLocation::default(),
            });
        }
        script.locate();
        script.validate()?;
        Ok(script)
    }
}
