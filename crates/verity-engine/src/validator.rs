//! Validator - one-call validation of a script against models

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::profiler::Profiler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use verity_core::{ModelRepository, Script, UnsatisfiedConstraint, ValueMap};

/// Outcome of a validation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Unsatisfied constraints, in merge order
    pub unsatisfied: Vec<UnsatisfiedConstraint>,
    /// Cumulative time per qualified constraint name
    pub execution_times: Profiler,
    /// Number of jobs in the canonical list
    pub job_count: usize,
    /// Checks that raised an error instead of returning a result
    pub job_failures: usize,
}

impl ValidationReport {
    /// Build a report from a finished context
    pub fn from_context(mut ctx: ExecutionContext) -> Self {
        Self {
            job_count: ctx.jobs().len(),
            job_failures: ctx.job_failures(),
            execution_times: ctx.take_profiler(),
            unsatisfied: ctx.take_unsatisfied(),
        }
    }

    /// Whether every constraint held
    pub fn is_valid(&self) -> bool {
        self.unsatisfied.is_empty()
    }

    /// Unsatisfied constraints in a stable order
    pub fn sorted(&self) -> Vec<&UnsatisfiedConstraint> {
        let mut out: Vec<_> = self.unsatisfied.iter().collect();
        out.sort();
        out
    }

    /// Failures of one constraint, by qualified name (`Context.Name`)
    pub fn failures_of<'a>(
        &'a self,
        qualified: &'a str,
    ) -> impl Iterator<Item = &'a UnsatisfiedConstraint> {
        self.unsatisfied
            .iter()
            .filter(move |u| u.constraint.to_string() == qualified)
    }
}

/// Validates a script against a model repository
///
/// # Example
///
/// ```
/// use verity_core::{Constraint, ConstraintContext, Expr, Model, ModelRepository, Script};
/// use verity_engine::Validator;
///
/// let script = Script::new("inline").with_context(
///     ConstraintContext::new("Person")
///         .with_constraint(Constraint::new("HasName", Expr::HasProperty("name".into()))),
/// );
/// let mut model = Model::new("people");
/// model.elements.create("Person").set("name", "Ann");
/// model.elements.create("Person");
/// let repository = ModelRepository::new().with_model(model).unwrap();
///
/// let report = Validator::new(script, repository).run().unwrap();
/// assert_eq!(report.unsatisfied.len(), 1);
/// ```
pub struct Validator {
    script: Arc<Script>,
    repository: Arc<ModelRepository>,
    parameters: ValueMap,
    config: EngineConfig,
}

impl Validator {
    pub fn new(
        script: impl Into<Arc<Script>>,
        repository: impl Into<Arc<ModelRepository>>,
    ) -> Self {
        Self {
            script: script.into(),
            repository: repository.into(),
            parameters: ValueMap::new(),
            config: EngineConfig::default(),
        }
    }

    /// Override script variables
    pub fn with_parameters(mut self, parameters: ValueMap) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the execution context without running it
    pub fn context(&self) -> Result<ExecutionContext> {
        ExecutionContext::new(
            Arc::clone(&self.script),
            Arc::clone(&self.repository),
            self.parameters.clone(),
            self.config.clone(),
        )
    }

    /// Run every job with the configured strategy
    pub fn run(&self) -> Result<ValidationReport> {
        let mut ctx = self.context()?;
        let strategy = ctx.config().strategy();
        strategy.check_constraints(&mut ctx)?;
        let report = ValidationReport::from_context(ctx);
        tracing::info!(
            jobs = report.job_count,
            unsatisfied = report.unsatisfied.len(),
            errored = report.job_failures,
            "validation finished"
        );
        Ok(report)
    }
}
