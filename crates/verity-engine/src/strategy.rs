//! Execution strategies
//!
//! Every strategy records each (constraint, job) pair once and produces the
//! same unsatisfied constraints as the sequential strategy, under every
//! merge mode. They only differ in how the work is cut into pool tasks.

use crate::context::{ExecutionContext, MergeMode};
use crate::error::Result;
use crate::evaluate::run_job;
use crate::job::Job;
use serde::{Deserialize, Serialize};
use verity_core::ConstraintId;

/// How jobs are spread over the local pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// Every job in order on the calling thread
    #[default]
    Sequential,
    /// One pool task per job
    ElementParallel,
    /// One pool task per constraint, covering every job of its context
    ConstraintParallel,
    /// One dependency level at a time, one pool task per job within a level
    Staged,
}

impl ExecutionStrategy {
    /// Evaluate the context's full job list
    pub fn check_constraints(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let jobs = ctx.jobs();
        self.check_jobs(ctx, &jobs)
    }

    /// Evaluate a subset of jobs, merging results into the context
    pub fn check_jobs(&self, ctx: &mut ExecutionContext, jobs: &[Job]) -> Result<()> {
        tracing::debug!(strategy = ?self, jobs = jobs.len(), "checking constraints");
        match self {
            ExecutionStrategy::Sequential => {
                let outcome =
                    ctx.for_each_task(jobs, |ctx, job, local| run_job(ctx, job, local, |_| true));
                let mode = match outcome {
                    Ok(()) => ctx.config().merge_mode(),
                    Err(_) => MergeMode::Discard,
                };
                ctx.merge_locals(mode);
                outcome
            }
            ExecutionStrategy::ElementParallel => ctx.parallel(|ctx| {
                ctx.for_each_task(jobs, |ctx, job, local| run_job(ctx, job, local, |_| true))
            }),
            ExecutionStrategy::ConstraintParallel => {
                let constraints: Vec<ConstraintId> = ctx.schedule().order().to_vec();
                ctx.parallel(|ctx| {
                    ctx.for_each_task(&constraints, |ctx, id, local| {
                        for job in jobs.iter().filter(|j| j.context() == id.context) {
                            run_job(ctx, job, local, |c| c == *id)?;
                        }
                        Ok(())
                    })
                })
            }
            ExecutionStrategy::Staged => {
                // One phase per level: ending a phase merges the traces the
                // next level's `Satisfies` lookups rely on
                let levels = ctx.schedule().levels().to_vec();
                for level in &levels {
                    ctx.parallel(|ctx| {
                        ctx.for_each_task(jobs, |ctx, job, local| {
                            run_job(ctx, job, local, |c| level.contains(&c))
                        })
                    })?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, ExecutionContext};
    use verity_core::{
        Constraint, ConstraintContext, Expr, Model, ModelRepository, Script, UnsatisfiedConstraint,
        ValueMap,
    };

    fn script() -> Script {
        Script::new("people.ron")
            .with_context(
                ConstraintContext::new("Person")
                    .with_constraint(Constraint::new(
                        "NameNotEmpty",
                        Expr::Ne(Box::new(Expr::prop("name")), Box::new(Expr::lit(""))),
                    ))
                    .with_constraint(Constraint::new(
                        "AdultHasName",
                        Expr::Implies(
                            Box::new(Expr::Ge(
                                Box::new(Expr::prop("age")),
                                Box::new(Expr::lit(18i64)),
                            )),
                            Box::new(Expr::satisfies("NameNotEmpty")),
                        ),
                    ))
                    .with_constraint(
                        Constraint::new(
                            "Positive",
                            Expr::Gt(Box::new(Expr::prop("age")), Box::new(Expr::lit(0i64))),
                        )
                        .depends_on("NameNotEmpty"),
                    ),
            )
            .with_context(ConstraintContext::global("Totals").with_constraint(Constraint::new(
                "AtMostTen",
                Expr::Le(Box::new(Expr::CountOfKind("Person".into())), Box::new(Expr::lit(10i64))),
            )))
    }

    fn repository(n: u64) -> ModelRepository {
        let mut model = Model::new("people");
        for i in 0..n {
            let p = model.elements.create("Person");
            p.set("name", if i % 4 == 0 { "" } else { "x" });
            p.set("age", (i as i64 % 30) - 2);
        }
        ModelRepository::new().with_model(model).unwrap()
    }

    fn run(strategy: ExecutionStrategy, parallelism: usize, n: u64) -> Vec<UnsatisfiedConstraint> {
        let config = EngineConfig::parallel(parallelism).with_strategy(strategy);
        let mut ctx =
            ExecutionContext::new(script(), repository(n), ValueMap::new(), config).unwrap();
        strategy.check_constraints(&mut ctx).unwrap();
        let mut out = ctx.take_unsatisfied();
        out.sort();
        out
    }

    #[test]
    fn test_strategies_agree() {
        let expected = run(ExecutionStrategy::Sequential, 1, 40);
        assert!(!expected.is_empty());

        for strategy in [
            ExecutionStrategy::ElementParallel,
            ExecutionStrategy::ConstraintParallel,
            ExecutionStrategy::Staged,
        ] {
            for parallelism in [0, 1, 2, 4] {
                assert_eq!(
                    run(strategy, parallelism, 40),
                    expected,
                    "{:?} with parallelism {} differs from sequential",
                    strategy,
                    parallelism
                );
            }
        }
    }

    /// `Checked` fails wherever `Named` does, through `Satisfies`
    fn dependent_script(lazy: bool) -> Script {
        let named = Constraint::new(
            "Named",
            Expr::Ne(Box::new(Expr::prop("name")), Box::new(Expr::lit(""))),
        );
        Script::new("dependent.ron").with_context(
            ConstraintContext::new("Person")
                .with_constraint(if lazy { named.lazy() } else { named })
                .with_constraint(Constraint::new("Checked", Expr::satisfies("Named")))
                .with_constraint(Constraint::new("AlsoChecked", Expr::satisfies("Named"))),
        )
    }

    fn unnamed(n: u64) -> ModelRepository {
        let mut model = Model::new("people");
        for _ in 0..n {
            model.elements.create("Person").set("name", "");
        }
        ModelRepository::new().with_model(model).unwrap()
    }

    fn append_count(strategy: ExecutionStrategy, lazy: bool) -> usize {
        let config = EngineConfig::parallel(4)
            .with_strategy(strategy)
            .with_merge_mode(MergeMode::Append);
        let mut ctx =
            ExecutionContext::new(dependent_script(lazy), unnamed(200), ValueMap::new(), config)
                .unwrap();
        strategy.check_constraints(&mut ctx).unwrap();
        ctx.take_unsatisfied().len()
    }

    #[test]
    fn test_depended_upon_constraint_recorded_once_under_append() {
        for lazy in [false, true] {
            let expected = append_count(ExecutionStrategy::Sequential, lazy);
            assert_eq!(expected, 600);
            for strategy in [
                ExecutionStrategy::ElementParallel,
                ExecutionStrategy::ConstraintParallel,
                ExecutionStrategy::Staged,
            ] {
                assert_eq!(
                    append_count(strategy, lazy),
                    expected,
                    "{:?} (lazy: {}) recorded a result twice",
                    strategy,
                    lazy
                );
            }
        }
    }

    #[test]
    fn test_global_constraint_checked_once() {
        let failures = run(ExecutionStrategy::ElementParallel, 2, 12);
        let global: Vec<_> = failures.iter().filter(|u| u.element.is_none()).collect();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].constraint.to_string(), "Totals.AtMostTen");
    }

    #[test]
    fn test_check_jobs_subset() {
        let config = EngineConfig::parallel(2).without_shuffle();
        let mut ctx =
            ExecutionContext::new(script(), repository(8), ValueMap::new(), config).unwrap();
        let jobs = ctx.jobs();
        ExecutionStrategy::ElementParallel
            .check_jobs(&mut ctx, &jobs[..1])
            .unwrap();

        // element 0 has an empty name and age -2
        let names: Vec<_> = ctx
            .unsatisfied()
            .iter()
            .map(|u| u.constraint.constraint.as_str())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"NameNotEmpty"));
        assert!(names.contains(&"Positive"));
    }
}
