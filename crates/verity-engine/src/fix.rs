//! Fix application
//!
//! Fixes never run during validation. After a run completes, the caller may
//! apply the fixes attached to unsatisfied constraints to its own copy of
//! the models. Each fix is evaluated against the element as it is at that
//! moment, so earlier fixes are visible to later ones.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use verity_core::{
    ConstraintKey, ElementRef, EvalContext, FixAction, ModelRepository, Script,
    UnsatisfiedConstraint, Value, ValueMap,
};

/// A fix that was applied to an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFix {
    pub constraint: ConstraintKey,
    pub element: ElementRef,
    pub title: String,
}

enum Change {
    Set(String, Value),
    Remove(String),
}

/// Apply the fixes of every fixable unsatisfied constraint
///
/// Errored results, global results and constraints without a fix are
/// skipped, as are results whose element no longer exists. An expression
/// that fails while computing a fix aborts with the error; fixes applied
/// before it stay applied.
pub fn apply_fixes(
    script: &Script,
    repository: &mut ModelRepository,
    variables: &ValueMap,
    unsatisfied: &[UnsatisfiedConstraint],
) -> Result<Vec<AppliedFix>> {
    let mut applied = Vec::new();
    for u in unsatisfied.iter().filter(|u| !u.errored) {
        let Some(element_ref) = &u.element else { continue };
        let Some(fix) = script
            .context_index(&u.constraint.context)
            .and_then(|ci| script.contexts[ci].constraint(&u.constraint.constraint))
            .and_then(|(_, c)| c.fix.as_ref())
        else {
            continue;
        };

        let (title, changes) = {
            let Some(model) = repository.get(&element_ref.model) else { continue };
            let Some(element) = model.elements.get(element_ref.element) else { continue };
            let eval = EvalContext::new(repository, variables).with_target(model, element);

            let title = match &fix.title {
                Some(expr) => expr.eval(&eval)?.to_string(),
                None => format!("Fix {}", u.constraint),
            };
            let mut changes = Vec::with_capacity(fix.actions.len());
            for action in &fix.actions {
                changes.push(match action {
                    FixAction::SetProperty { property, value } => {
                        Change::Set(property.clone(), value.eval(&eval)?)
                    }
                    FixAction::RemoveProperty(property) => Change::Remove(property.clone()),
                });
            }
            (title, changes)
        };

        if let Some(element) = repository.resolve_mut(element_ref) {
            for change in changes {
                match change {
                    Change::Set(property, value) => element.set(property, value),
                    Change::Remove(property) => {
                        element.remove(&property);
                    }
                }
            }
        }
        tracing::debug!(element = %element_ref, fix = %title, "applied fix");
        applied.push(AppliedFix {
            constraint: u.constraint.clone(),
            element: element_ref.clone(),
            title,
        });
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Validator;
    use verity_core::{Constraint, ConstraintContext, Expr, Fix, Model};

    fn script() -> Script {
        Script::new("fixes.ron").with_context(
            ConstraintContext::new("Person").with_constraint(
                Constraint::new("HasName", Expr::HasProperty("name".into())).with_fix(Fix {
                    title: Some(Expr::Format("Name {0}".into(), vec![Expr::SelfRef])),
                    actions: vec![
                        FixAction::SetProperty {
                            property: "name".into(),
                            value: Expr::var("default_name"),
                        },
                        FixAction::RemoveProperty("stale".into()),
                    ],
                }),
            ),
        )
    }

    #[test]
    fn test_apply_fixes_after_run() {
        let script = script().with_variable("default_name", "anonymous");
        let mut model = Model::new("people");
        model.elements.create("Person").set("name", "Ann");
        model.elements.create("Person").set("stale", true);
        let mut repository = ModelRepository::new().with_model(model).unwrap();

        let report = Validator::new(script.clone(), repository.clone()).run().unwrap();
        assert_eq!(report.unsatisfied.len(), 1);

        let applied =
            apply_fixes(&script, &mut repository, &script.variables, &report.unsatisfied).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].title, "Name element:1");

        let fixed = repository.resolve(&applied[0].element).unwrap();
        assert_eq!(fixed.get("name"), Some(&Value::from("anonymous")));
        assert!(fixed.get("stale").is_none());

        let rerun = Validator::new(script, repository).run().unwrap();
        assert!(rerun.is_valid());
    }

    #[test]
    fn test_errored_results_are_not_fixed() {
        let script = script().with_variable("default_name", "anonymous");
        let mut model = Model::new("people");
        model.elements.create("Person");
        let mut repository = ModelRepository::new().with_model(model).unwrap();

        let errored = UnsatisfiedConstraint::errored(
            ConstraintKey::new("Person", "HasName"),
            Some(repository.models()[0].reference(verity_core::ElementId(0))),
            "boom",
        );
        let applied = apply_fixes(&script, &mut repository, &script.variables, &[errored]).unwrap();
        assert!(applied.is_empty());
    }
}
