//! Dependency scheduling for constraints
//!
//! Builds a graph with an edge `A -> B` whenever `B` depends on `A`, either
//! through its explicit `depends_on` list or a `Satisfies` reference, and
//! orders it topologically. Ties are broken by declaration order, so the
//! schedule is the same in every process that loads the same script.
//!
//! The schedule is computed once per run and cached by the execution context.

use crate::error::{CycleMember, Error, Result};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeSet, HashMap};
use verity_core::{ConstraintId, Script};

/// Topologically ordered constraints of a script
#[derive(Debug, Clone, Default)]
pub struct ConstraintSchedule {
    order: Vec<ConstraintId>,
    levels: Vec<Vec<ConstraintId>>,
    depended_on: IndexSet<ConstraintId>,
    dependencies: IndexMap<ConstraintId, Vec<ConstraintId>>,
}

impl ConstraintSchedule {
    /// Compute the schedule for a script
    ///
    /// Fails with [`Error::UnknownDependency`] when a dependency name does
    /// not resolve and [`Error::DependencyCycle`] when dependencies loop.
    pub fn compute(script: &Script) -> Result<Self> {
        let ids: Vec<ConstraintId> = script.constraints().map(|(id, _)| id).collect();
        let index: HashMap<ConstraintId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut dependencies: IndexMap<ConstraintId, Vec<ConstraintId>> = IndexMap::new();
        for (id, constraint) in script.constraints() {
            let mut deps = Vec::new();
            for name in constraint.dependencies() {
                let dep = script.resolve(name, id.context).ok_or_else(|| {
                    Error::UnknownDependency {
                        constraint: qualified(script, id),
                        dependency: name.to_string(),
                        location: constraint.location.clone(),
                    }
                })?;
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
            dependencies.insert(id, deps);
        }

        // Kahn's algorithm; the ready set is ordered by declaration index
        let mut indegree = vec![0usize; ids.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
        for (id, deps) in &dependencies {
            let node = index[id];
            indegree[node] = deps.len();
            for dep in deps {
                successors[index[dep]].push(node);
            }
        }
        let mut ready: BTreeSet<usize> = (0..ids.len()).filter(|&n| indegree[n] == 0).collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(node) = ready.pop_first() {
            order.push(ids[node]);
            for &next in &successors[node] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() < ids.len() {
            let remaining: BTreeSet<usize> =
                (0..ids.len()).filter(|&n| indegree[n] > 0).collect();
            return Err(Error::DependencyCycle {
                members: find_cycle(script, &ids, &index, &dependencies, &remaining),
            });
        }

        let mut level_of: HashMap<ConstraintId, usize> = HashMap::new();
        let mut levels: Vec<Vec<ConstraintId>> = Vec::new();
        for id in &order {
            let level = dependencies[id]
                .iter()
                .map(|d| level_of[d] + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(*id, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(*id);
        }

        let depended_on = dependencies.values().flatten().copied().collect();

        tracing::debug!(
            constraints = order.len(),
            levels = levels.len(),
            "computed constraint schedule"
        );

        Ok(Self {
            order,
            levels,
            depended_on,
            dependencies,
        })
    }

    /// Every constraint, dependencies first
    pub fn order(&self) -> &[ConstraintId] {
        &self.order
    }

    /// Constraints grouped by depth; level `n` depends only on levels `< n`
    pub fn levels(&self) -> &[Vec<ConstraintId>] {
        &self.levels
    }

    /// Constraints something else depends on
    pub fn depended_on(&self) -> &IndexSet<ConstraintId> {
        &self.depended_on
    }

    /// Whether any constraint depends on `id`
    pub fn is_depended_on(&self, id: ConstraintId) -> bool {
        self.depended_on.contains(&id)
    }

    /// Direct dependencies of a constraint
    pub fn dependencies_of(&self, id: ConstraintId) -> &[ConstraintId] {
        self.dependencies.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Constraints of one context, in schedule order
    pub fn for_context(&self, context: usize) -> impl Iterator<Item = ConstraintId> + '_ {
        self.order.iter().copied().filter(move |id| id.context == context)
    }
}

fn qualified(script: &Script, id: ConstraintId) -> String {
    script
        .qualified_name(id)
        .unwrap_or_else(|| format!("{}.{}", id.context, id.constraint))
}

/// Walk dependencies among the unscheduled nodes until one repeats
fn find_cycle(
    script: &Script,
    ids: &[ConstraintId],
    index: &HashMap<ConstraintId, usize>,
    dependencies: &IndexMap<ConstraintId, Vec<ConstraintId>>,
    remaining: &BTreeSet<usize>,
) -> Vec<CycleMember> {
    let mut path: Vec<usize> = Vec::new();
    let mut current = remaining.first().copied();
    while let Some(node) = current {
        if let Some(start) = path.iter().position(|&n| n == node) {
            path.drain(..start);
            break;
        }
        path.push(node);
        // Every unscheduled node has at least one unscheduled dependency
        current = dependencies[&ids[node]]
            .iter()
            .map(|d| index[d])
            .find(|d| remaining.contains(d));
    }
    path.into_iter()
        .map(|n| {
            let id = ids[n];
            CycleMember {
                name: qualified(script, id),
                location: script
                    .constraint(id)
                    .map(|c| c.location.clone())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use verity_core::{Constraint, ConstraintContext, Expr};

    fn ok() -> Expr {
        Expr::lit(true)
    }

    #[test]
    fn test_declaration_order_without_dependencies() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("P")
                .with_constraint(Constraint::new("A", ok()))
                .with_constraint(Constraint::new("B", ok()))
                .with_constraint(Constraint::new("C", ok())),
        );
        let schedule = ConstraintSchedule::compute(&script).unwrap();
        assert_eq!(
            schedule.order(),
            &[ConstraintId::new(0, 0), ConstraintId::new(0, 1), ConstraintId::new(0, 2)]
        );
        assert_eq!(schedule.levels().len(), 1);
        assert!(schedule.depended_on().is_empty());
    }

    #[test]
    fn test_dependencies_come_first() {
        // B depends on C explicitly; A depends on B through Satisfies
        let script = Script::new("s").with_context(
            ConstraintContext::new("P")
                .with_constraint(Constraint::new("A", Expr::satisfies("B")))
                .with_constraint(Constraint::new("B", ok()).depends_on("C"))
                .with_constraint(Constraint::new("C", ok())),
        );
        let schedule = ConstraintSchedule::compute(&script).unwrap();
        let names: Vec<_> = schedule
            .order()
            .iter()
            .map(|id| script.qualified_name(*id).unwrap())
            .collect();
        assert_eq!(names, vec!["P.C", "P.B", "P.A"]);
        assert_eq!(schedule.levels().len(), 3);
        assert!(schedule.is_depended_on(ConstraintId::new(0, 1)));
        assert!(schedule.is_depended_on(ConstraintId::new(0, 2)));
        assert!(!schedule.is_depended_on(ConstraintId::new(0, 0)));
        assert_eq!(schedule.dependencies_of(ConstraintId::new(0, 0)), &[ConstraintId::new(0, 1)]);
    }

    #[test]
    fn test_cross_context_dependency() {
        let script = Script::new("s")
            .with_context(
                ConstraintContext::new("P")
                    .with_constraint(Constraint::new("A", ok()).depends_on("Q.X")),
            )
            .with_context(ConstraintContext::new("Q").with_constraint(Constraint::new("X", ok())));
        let schedule = ConstraintSchedule::compute(&script).unwrap();
        assert_eq!(schedule.order(), &[ConstraintId::new(1, 0), ConstraintId::new(0, 0)]);
        assert_eq!(schedule.for_context(0).collect::<Vec<_>>(), vec![ConstraintId::new(0, 0)]);
    }

    #[test]
    fn test_cycle_reports_members_with_locations() {
        let script = Script::new("cyclic.ron").with_context(
            ConstraintContext::new("P")
                .with_constraint(Constraint::new("Free", ok()))
                .with_constraint(Constraint::new("A", ok()).depends_on("B"))
                .with_constraint(Constraint::new("B", Expr::satisfies("A"))),
        );
        let err = ConstraintSchedule::compute(&script).unwrap_err();
        match err {
            Error::DependencyCycle { members } => {
                let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
                assert_eq!(names, vec!["P.A", "P.B"]);
                assert_eq!(
                    members[0].location.to_string(),
                    "cyclic.ron: contexts[0].constraints[1]"
                );
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("P").with_constraint(Constraint::new("A", ok()).depends_on("A")),
        );
        assert!(matches!(
            ConstraintSchedule::compute(&script),
            Err(Error::DependencyCycle { members }) if members.len() == 1
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let script = Script::new("s").with_context(
            ConstraintContext::new("P")
                .with_constraint(Constraint::new("A", ok()).depends_on("Missing")),
        );
        let err = ConstraintSchedule::compute(&script).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Missing"));
    }
}
