//! Jobs: the atoms of validation work
//!
//! A job is either a (context, element) pair or, for global contexts, a
//! (context, constraint) pair evaluated against the run's parameter
//! bindings. Jobs are addressed by index into the canonical job list, so
//! every process that enumerates the same script and models must arrive at
//! the same list. [`enumerate_jobs`] is a pure function of its inputs and
//! [`shuffle_jobs`] is a pure function of the list and the seed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use verity_core::{
    ConstraintId, Element, ElementId, EvalContext, Model, ModelRepository, Script, SeededRng,
    ValueMap,
};

/// One unit of validation work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Job {
    /// Check every applicable constraint of a context against one element
    Element {
        /// Context index in the script
        context: usize,
        /// Model index in the repository
        model: usize,
        /// Element within the model
        element: ElementId,
    },
    /// Check one constraint of a global context against the parameter bindings
    Parameters {
        /// Context index in the script
        context: usize,
        /// Constraint index in the context
        constraint: usize,
    },
}

impl Job {
    /// Context index this job belongs to
    pub fn context(&self) -> usize {
        match self {
            Job::Element { context, .. } | Job::Parameters { context, .. } => *context,
        }
    }

    /// Constraint id of a parameter job
    pub fn constraint(&self) -> Option<ConstraintId> {
        match self {
            Job::Parameters {
                context,
                constraint,
            } => Some(ConstraintId::new(*context, *constraint)),
            Job::Element { .. } => None,
        }
    }

    /// Resolve an element job against the repository
    pub fn resolve<'a>(
        &self,
        repository: &'a ModelRepository,
    ) -> Result<Option<(&'a Model, &'a Element)>> {
        match self {
            Job::Parameters { .. } => Ok(None),
            Job::Element { model, element, .. } => {
                let m = repository
                    .models()
                    .get(*model)
                    .ok_or_else(|| Error::JobNotResolvable(self.to_string()))?;
                let e = m
                    .elements
                    .get(*element)
                    .ok_or_else(|| Error::JobNotResolvable(self.to_string()))?;
                Ok(Some((m, e)))
            }
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Element {
                context,
                model,
                element,
            } => write!(f, "job(context {}, model {}, {})", context, model, element),
            Job::Parameters {
                context,
                constraint,
            } => write!(f, "job(context {}, constraint {})", context, constraint),
        }
    }
}

/// Enumerate the canonical job list
///
/// Contexts in declaration order, then models in repository order, then
/// elements in insertion order. Elements whose context guard does not hold
/// are left out. A global context yields one parameter job per constraint.
pub fn enumerate_jobs(
    script: &Script,
    repository: &ModelRepository,
    variables: &ValueMap,
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for (ci, context) in script.contexts.iter().enumerate() {
        let Some(kind) = &context.kind else {
            jobs.extend((0..context.constraints.len()).map(|k| Job::Parameters {
                context: ci,
                constraint: k,
            }));
            continue;
        };
        for (mi, model) in repository.models().iter().enumerate() {
            for element in model.elements.of_kind(kind) {
                if let Some(guard) = &context.guard {
                    let eval = EvalContext::new(repository, variables).with_target(model, element);
                    if !guard.eval(&eval)?.is_truthy() {
                        continue;
                    }
                }
                jobs.push(Job::Element {
                    context: ci,
                    model: mi,
                    element: element.id,
                });
            }
        }
    }
    tracing::debug!(jobs = jobs.len(), contexts = script.contexts.len(), "enumerated jobs");
    Ok(jobs)
}

/// Deterministically shuffle a job list in place
pub fn shuffle_jobs(jobs: &mut [Job], seed: u64) {
    SeededRng::new(seed).shuffle(jobs);
}
