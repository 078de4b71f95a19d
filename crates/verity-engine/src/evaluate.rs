//! Constraint evaluation for a single job
//!
//! A [`Checker`] evaluates the constraints of one job and answers
//! `Satisfies` queries on demand. It writes only into the calling thread's
//! [`LocalResults`], through a `RefCell` so the oracle (which only gets
//! `&self`) can record nested results. The cell is never borrowed while an
//! expression is being evaluated, since evaluation may re-enter the oracle.

use crate::batch::Batch;
use crate::context::{ExecutionContext, LocalResults, TraceKey};
use crate::error::Result;
use crate::job::Job;
use std::cell::RefCell;
use std::time::Instant;
use verity_core::{
    Constraint, ConstraintId, ConstraintKey, ConstraintOracle, Element, ElementRef, EvalContext,
    Model, UnsatisfiedConstraint,
};

struct Checker<'a> {
    ctx: &'a ExecutionContext,
    context: usize,
    target: Option<(&'a Model, &'a Element)>,
    element: Option<ElementRef>,
    local: RefCell<&'a mut LocalResults>,
}

enum Outcome {
    NotApplicable,
    Satisfied,
    Unsatisfied(String),
    Errored(String),
}

impl<'a> Checker<'a> {
    fn new(
        ctx: &'a ExecutionContext,
        context: usize,
        target: Option<(&'a Model, &'a Element)>,
        local: &'a mut LocalResults,
    ) -> Self {
        Self {
            ctx,
            context,
            target,
            element: target.map(|(m, e)| m.reference(e.id)),
            local: RefCell::new(local),
        }
    }

    fn eval_context(&self) -> EvalContext<'_> {
        let eval = EvalContext::new(self.ctx.repository(), self.ctx.variables()).with_oracle(self);
        match self.target {
            Some((model, element)) => eval.with_target(model, element),
            None => eval,
        }
    }

    fn lookup(&self, key: &TraceKey) -> Option<bool> {
        let cached = self.local.borrow().trace.get(key).copied();
        cached.or_else(|| self.ctx.traced(key))
    }

    /// Evaluate a constraint on this job's target
    ///
    /// The main pass always evaluates and records. An on-demand evaluation
    /// reuses a traced outcome if there is one, and records only constraints
    /// the main pass skips, once across all threads of the phase. Any other
    /// on-demand result just answers `Satisfies`: the main pass records it.
    fn check(&self, id: ConstraintId, on_demand: bool) -> verity_core::Result<bool> {
        let key: TraceKey = (id, self.element.clone());
        if on_demand {
            if let Some(known) = self.lookup(&key) {
                return Ok(known);
            }
        }

        let script = self.ctx.script();
        let (Some(context), Some(constraint)) =
            (script.contexts.get(id.context), script.constraint(id))
        else {
            return Err(verity_core::Error::UnknownConstraint(format!(
                "{}.{}",
                id.context, id.constraint
            )));
        };
        let name = ConstraintKey::new(&context.name, &constraint.name);
        let record = !on_demand || (!in_main_pass(self.ctx, id) && self.ctx.claim(&key));

        let started = Instant::now();
        let outcome = self.outcome(&name, constraint);
        let elapsed = started.elapsed();

        let satisfied = matches!(outcome, Outcome::NotApplicable | Outcome::Satisfied);
        let recorded = match outcome {
            _ if !record => None,
            Outcome::Unsatisfied(message) => Some(UnsatisfiedConstraint::new(
                name.clone(),
                self.element.clone(),
                message,
            )),
            Outcome::Errored(message) => {
                self.ctx.handler().record_job_failure(&message);
                Some(UnsatisfiedConstraint::errored(
                    name.clone(),
                    self.element.clone(),
                    message,
                ))
            }
            Outcome::NotApplicable | Outcome::Satisfied => None,
        };

        let mut local = self.local.borrow_mut();
        if record {
            local.profiler.add(&name.to_string(), elapsed);
        }
        if let Some(u) = recorded {
            local.unsatisfied.push(u);
        }
        if self.ctx.schedule().is_depended_on(id) {
            local.trace.insert(key, satisfied);
        }
        Ok(satisfied)
    }

    fn outcome(&self, name: &ConstraintKey, constraint: &Constraint) -> Outcome {
        let eval = self.eval_context();
        if let Some(guard) = &constraint.guard {
            match guard.eval(&eval) {
                Ok(v) if !v.is_truthy() => return Outcome::NotApplicable,
                Ok(_) => {}
                Err(e) => return Outcome::Errored(self.error_message(name, &e)),
            }
        }
        match constraint.check.eval(&eval) {
            Ok(v) if v.is_truthy() => Outcome::Satisfied,
            Ok(_) => Outcome::Unsatisfied(self.message(name, constraint, &eval)),
            Err(e) => Outcome::Errored(self.error_message(name, &e)),
        }
    }

    fn default_message(&self, name: &ConstraintKey) -> String {
        match &self.element {
            Some(element) => format!("Invariant {} failed for {}", name.constraint, element),
            None => format!("Invariant {} failed", name.constraint),
        }
    }

    fn message(&self, name: &ConstraintKey, constraint: &Constraint, eval: &EvalContext) -> String {
        match &constraint.message {
            None => self.default_message(name),
            Some(expr) => match expr.eval(eval) {
                Ok(v) => v.to_string(),
                Err(e) => format!("{} (message failed: {})", self.default_message(name), e),
            },
        }
    }

    fn error_message(&self, name: &ConstraintKey, error: &verity_core::Error) -> String {
        match &self.element {
            Some(element) => format!("{} raised an error for {}: {}", name, element, error),
            None => format!("{} raised an error: {}", name, error),
        }
    }
}

impl ConstraintOracle for Checker<'_> {
    fn satisfies(&self, constraint: &str) -> verity_core::Result<bool> {
        let id = self
            .ctx
            .script()
            .resolve(constraint, self.context)
            .ok_or_else(|| verity_core::Error::UnknownConstraint(constraint.to_string()))?;
        self.check(id, true)
    }
}

/// Whether the main pass evaluates a constraint
///
/// Lazy constraints that something depends on run only on demand. Lazy
/// constraints nothing depends on run normally unless `optimize` is set.
pub fn in_main_pass(ctx: &ExecutionContext, id: ConstraintId) -> bool {
    match ctx.script().constraint(id) {
        Some(c) if c.lazy => !ctx.schedule().is_depended_on(id) && !ctx.config().optimize(),
        Some(_) => true,
        None => false,
    }
}

/// Evaluate the selected constraints of one job into `local`
///
/// Constraints run in schedule order. Evaluation errors are recorded as
/// errored results; only unresolvable jobs are returned as errors.
pub fn run_job(
    ctx: &ExecutionContext,
    job: &Job,
    local: &mut LocalResults,
    select: impl Fn(ConstraintId) -> bool,
) -> Result<()> {
    let target = job.resolve(ctx.repository())?;
    let checker = Checker::new(ctx, job.context(), target, local);
    let selected = |id: ConstraintId| select(id) && in_main_pass(ctx, id);

    match job.constraint() {
        Some(id) => {
            if selected(id) {
                checker.check(id, false)?;
            }
        }
        None => {
            for id in ctx.schedule().for_context(job.context()) {
                if selected(id) {
                    checker.check(id, false)?;
                }
            }
        }
    }
    Ok(())
}

/// Evaluate a list of jobs with the configured strategy and return the
/// unsatisfied constraints they produced
pub fn evaluate_jobs(
    jobs: &[Job],
    ctx: &mut ExecutionContext,
) -> Result<Vec<UnsatisfiedConstraint>> {
    let strategy = ctx.config().strategy();
    strategy.check_jobs(ctx, jobs)?;
    Ok(ctx.take_unsatisfied())
}

/// Evaluate the jobs of one batch
///
/// Returns only negative results. Fails if the batch does not fit the job
/// list, which means the caller enumerated a different list.
pub fn evaluate(
    batch: Batch,
    jobs: &[Job],
    ctx: &mut ExecutionContext,
) -> Result<Vec<UnsatisfiedConstraint>> {
    let slice = batch.slice(jobs)?;
    tracing::debug!(%batch, jobs = slice.len(), "evaluating batch");
    evaluate_jobs(slice, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{split_into_batches, EngineConfig, ExecutionContext};
    use verity_core::{
        Constraint, ConstraintContext, Expr, Model, ModelRepository, Script, ValueMap,
    };

    fn repository() -> ModelRepository {
        let mut model = Model::new("m");
        model.elements.create("Item").set("size", 5i64);
        model.elements.create("Item").set("size", -1i64);
        model.elements.create("Item").set("size", "big");
        ModelRepository::new().with_model(model).unwrap()
    }

    fn context(script: Script, config: EngineConfig) -> ExecutionContext {
        ExecutionContext::new(script, repository(), ValueMap::new(), config.without_shuffle())
            .unwrap()
    }

    fn positive() -> Expr {
        Expr::Gt(Box::new(Expr::prop("size")), Box::new(Expr::lit(0i64)))
    }

    fn names(failures: &[UnsatisfiedConstraint]) -> Vec<String> {
        let mut out: Vec<_> = failures
            .iter()
            .map(|u| {
                let element = u.element.as_ref().map(|e| e.element.raw()).unwrap_or(99);
                format!("{}@{}", u.constraint.constraint, element)
            })
            .collect();
        out.sort();
        out
    }

    // ========================================================================
    // Outcome tests
    // ========================================================================

    #[test]
    fn test_default_and_custom_messages() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item")
                .with_constraint(Constraint::new("Positive", positive()))
                .with_constraint(
                    Constraint::new(
                        "Small",
                        Expr::Lt(Box::new(Expr::prop("size")), Box::new(Expr::lit(0i64))),
                    )
                    .with_message(Expr::Format(
                        "{0} is too big".into(),
                        vec![Expr::prop("size")],
                    )),
                ),
        );
        let mut ctx = context(script, EngineConfig::default());
        let jobs = ctx.jobs();
        let failures = evaluate(Batch::new(0, 1), &jobs, &mut ctx).unwrap();

        let messages: Vec<_> = failures.iter().map(|u| u.message.as_str()).collect();
        assert_eq!(messages, vec!["5 is too big"]);

        let failures = evaluate(Batch::new(1, 2), &jobs, &mut ctx).unwrap();
        assert_eq!(failures[0].message, "Invariant Positive failed for m#element:1");
    }

    #[test]
    fn test_evaluation_error_is_recorded_not_fatal() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item").with_constraint(Constraint::new("Positive", positive())),
        );
        let mut ctx = context(script, EngineConfig::parallel(2));
        let jobs = ctx.jobs();
        let failures = evaluate(Batch::new(0, 3), &jobs, &mut ctx).unwrap();

        assert_eq!(names(&failures), vec!["Positive@1", "Positive@2"]);
        let errored: Vec<_> = failures.iter().filter(|u| u.errored).collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].element.as_ref().unwrap().element.raw(), 2);
        assert_eq!(ctx.job_failures(), 1);
    }

    #[test]
    fn test_constraint_guard_skips_without_recording() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item").with_constraint(
                Constraint::new("Positive", positive())
                    .with_guard(Expr::IsKind("Nothing".into())),
            ),
        );
        let mut ctx = context(script, EngineConfig::default());
        let jobs = ctx.jobs();
        assert!(evaluate(Batch::new(0, 3), &jobs, &mut ctx).unwrap().is_empty());
    }

    // ========================================================================
    // Dependency tests
    // ========================================================================

    #[test]
    fn test_satisfies_evaluates_lazy_dependency_on_demand() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item")
                .with_constraint(Constraint::new("Positive", positive()).lazy())
                .with_constraint(Constraint::new(
                    "PositiveAndOdd",
                    Expr::And(vec![
                        Expr::satisfies("Positive"),
                        Expr::Eq(
                            Box::new(Expr::Mod(
                                Box::new(Expr::prop("size")),
                                Box::new(Expr::lit(2i64)),
                            )),
                            Box::new(Expr::lit(1i64)),
                        ),
                    ]),
                )),
        );
        let mut ctx = context(script, EngineConfig::default());
        let jobs = ctx.jobs();
        let failures = evaluate(Batch::new(0, 2), &jobs, &mut ctx).unwrap();

        // element 1: Positive fails on demand, so PositiveAndOdd fails too
        assert_eq!(names(&failures), vec!["Positive@1", "PositiveAndOdd@1"]);
        assert!(ctx.profiler().get("Item.Positive").is_some());
    }

    #[test]
    fn test_lazy_dependency_skipped_when_not_reached() {
        // Implication short-circuits, so the lazy dependency never runs
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item")
                .with_constraint(Constraint::new("Positive", positive()).lazy())
                .with_constraint(Constraint::new(
                    "NeverReached",
                    Expr::Implies(
                        Box::new(Expr::lit(false)),
                        Box::new(Expr::satisfies("Positive")),
                    ),
                )),
        );
        let mut ctx = context(script, EngineConfig::default());
        let jobs = ctx.jobs();
        assert!(evaluate(Batch::new(0, 2), &jobs, &mut ctx).unwrap().is_empty());
    }

    #[test]
    fn test_optimize_drops_unreferenced_lazy() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item")
                .with_constraint(Constraint::new("Positive", positive()).lazy()),
        );

        let mut plain = context(script.clone(), EngineConfig::default());
        let jobs = plain.jobs();
        assert_eq!(evaluate(Batch::new(0, 2), &jobs, &mut plain).unwrap().len(), 1);

        let mut optimized = context(script, EngineConfig::default().with_optimize(true));
        assert!(evaluate(Batch::new(0, 2), &jobs, &mut optimized).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_satisfies_reference_fails_schedule() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item")
                .with_constraint(Constraint::new("A", Expr::satisfies("Ghost"))),
        );
        let config = EngineConfig::default();
        let err = ExecutionContext::new(script, repository(), ValueMap::new(), config)
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::UnknownDependency { .. }));
    }

    // ========================================================================
    // Batch tests
    // ========================================================================

    #[test]
    fn test_batches_partition_results() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("Item").with_constraint(Constraint::new("Positive", positive())),
        );
        let mut ctx = context(script, EngineConfig::parallel(2));
        let jobs = ctx.jobs();

        let mut all = Vec::new();
        for batch in split_into_batches(jobs.len(), 2) {
            all.extend(evaluate(batch, &jobs, &mut ctx).unwrap());
        }
        assert_eq!(names(&all), vec!["Positive@1", "Positive@2"]);
        assert!(evaluate(Batch::new(2, 9), &jobs, &mut ctx).is_err());
    }
}
