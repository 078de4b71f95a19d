//! Execution Context - Thread pool lifecycle and result aggregation
//!
//! The context owns everything a run needs to evaluate jobs: the script,
//! the models, the resolved variables, the cached schedule and the cached
//! canonical job list. It moves between two phases:
//!
//! ```text
//!   Sequential ──go_parallel()──▶ Parallel ──end_parallel()──▶ Sequential
//!                                   │
//!                                   ├── for_each_task(): tasks write to
//!                                   │   their thread's LocalResults slot
//!                                   └── fatal error: cancel + re-raise
//! ```
//!
//! During the parallel phase the shared result set is never touched. Each
//! pool thread writes into its own [`LocalResults`]. Ending the phase merges
//! every slot into the shared set on the calling thread, using the
//! configured [`MergeMode`]. If a fatal error was raised, the slots are
//! discarded instead.
//!
//! The pool is built by the first `go_parallel()` and kept for the life of
//! the context, so a caller that opens many short phases (one per atom, one
//! per dependency level) pays for thread start-up once.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::exception::ExceptionHandler;
use crate::job::{enumerate_jobs, shuffle_jobs, Job};
use crate::profiler::Profiler;
use crate::scheduler::ConstraintSchedule;
use crate::thread_local::{ThreadLocalStore, WorkerKey};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use verity_core::{
    ConstraintId, ElementRef, ModelRepository, Script, UnsatisfiedConstraint, ValueMap,
};

/// Key of the satisfaction trace: a constraint applied to an element
/// (`None` for parameter jobs)
pub type TraceKey = (ConstraintId, Option<ElementRef>);

/// How thread-local results fold into the shared set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeMode {
    /// Add results not already present (structural equality)
    #[default]
    Union,
    /// Add every result, keeping duplicates
    Append,
    /// Drop thread-local results
    Discard,
}

/// Execution phase of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sequential,
    Parallel,
}

/// Results accumulated by one thread
#[derive(Debug, Default)]
pub struct LocalResults {
    /// Constraints found unsatisfied
    pub unsatisfied: Vec<UnsatisfiedConstraint>,
    /// Time spent per constraint
    pub profiler: Profiler,
    /// Outcomes of depended-upon constraints, answered by `Satisfies`
    pub trace: HashMap<TraceKey, bool>,
}

/// Whether the calling thread may start a parallel phase
///
/// Pool worker threads may not: a nested pool would multiply the thread
/// count and can deadlock on the outer pool.
pub fn is_parallelisation_legal() -> bool {
    rayon::current_thread_index().is_none()
}

/// Per-run execution state
pub struct ExecutionContext {
    script: Arc<Script>,
    repository: Arc<ModelRepository>,
    variables: ValueMap,
    config: EngineConfig,
    schedule: ConstraintSchedule,
    jobs: Arc<Vec<Job>>,
    phase: Phase,
    pool: Option<rayon::ThreadPool>,
    locals: Arc<ThreadLocalStore<LocalResults>>,
    handler: ExceptionHandler,
    unsatisfied: Vec<UnsatisfiedConstraint>,
    seen: HashSet<UnsatisfiedConstraint>,
    profiler: Profiler,
    trace: HashMap<TraceKey, bool>,
    /// On-demand evaluations already recorded by some thread since the
    /// last merge
    claims: Mutex<HashSet<TraceKey>>,
}

impl ExecutionContext {
    /// Create a context, computing the schedule and the job list
    ///
    /// `parameters` override script variables of the same name. Fails on
    /// dependency cycles and unresolved dependencies before any job runs.
    pub fn new(
        script: impl Into<Arc<Script>>,
        repository: impl Into<Arc<ModelRepository>>,
        parameters: ValueMap,
        config: EngineConfig,
    ) -> Result<Self> {
        let script = script.into();
        let repository = repository.into();

        let mut variables = script.variables.clone();
        variables.extend(parameters);

        let schedule = ConstraintSchedule::compute(&script)?;
        let mut jobs = enumerate_jobs(&script, &repository, &variables)?;
        if let Some(seed) = config.shuffle_seed() {
            shuffle_jobs(&mut jobs, seed);
        }

        tracing::info!(
            origin = %script.origin,
            models = repository.len(),
            constraints = script.constraint_count(),
            jobs = jobs.len(),
            "execution context ready"
        );

        Ok(Self {
            script,
            repository,
            variables,
            config,
            schedule,
            jobs: Arc::new(jobs),
            phase: Phase::Sequential,
            pool: None,
            locals: Arc::new(ThreadLocalStore::new()),
            handler: ExceptionHandler::new(),
            unsatisfied: Vec::new(),
            seen: HashSet::new(),
            profiler: Profiler::new(),
            trace: HashMap::new(),
            claims: Mutex::new(HashSet::new()),
        })
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn repository(&self) -> &ModelRepository {
        &self.repository
    }

    /// Script variables overlaid with run parameters
    pub fn variables(&self) -> &ValueMap {
        &self.variables
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The cached dependency schedule
    pub fn schedule(&self) -> &ConstraintSchedule {
        &self.schedule
    }

    /// The cached canonical job list (shuffled if a seed is configured)
    pub fn jobs(&self) -> Arc<Vec<Job>> {
        Arc::clone(&self.jobs)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn handler(&self) -> &ExceptionHandler {
        &self.handler
    }

    /// Merged unsatisfied constraints
    pub fn unsatisfied(&self) -> &[UnsatisfiedConstraint] {
        &self.unsatisfied
    }

    /// Merged per-constraint execution times
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Non-fatal evaluation failures so far
    pub fn job_failures(&self) -> usize {
        self.handler.job_failures()
    }

    /// Look up a merged satisfaction outcome
    pub fn traced(&self, key: &TraceKey) -> Option<bool> {
        self.trace.get(key).copied()
    }

    /// Claim the right to record an on-demand evaluation of `key`
    ///
    /// Returns `true` for the first caller only, until the next merge.
    pub(crate) fn claim(&self, key: &TraceKey) -> bool {
        self.claims.lock().insert(key.clone())
    }

    /// Whether the pool has been built
    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Start the parallel phase
    ///
    /// The first call builds a pool of `resolved_parallelism()` named
    /// threads; each thread registers its result slot as it starts. Later
    /// phases reuse it.
    pub fn go_parallel(&mut self) -> Result<()> {
        if self.phase == Phase::Parallel {
            return Err(Error::InvalidState("already in the parallel phase".into()));
        }
        if !is_parallelisation_legal() {
            return Err(Error::NestedParallelism);
        }

        if self.pool.is_none() {
            let threads = self.config.resolved_parallelism();
            let locals = Arc::clone(&self.locals);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("verity-worker-{}", i))
                .start_handler(move |i| locals.register(WorkerKey::Pool(i)))
                .build()
                .map_err(|e| Error::ThreadPool(e.to_string()))?;
            tracing::debug!(threads, "thread pool started");
            self.pool = Some(pool);
        }

        self.handler.reset();
        self.phase = Phase::Parallel;
        Ok(())
    }

    /// End the parallel phase and merge thread-local results
    ///
    /// Results are discarded when a fatal error was raised in the phase.
    pub fn end_parallel(&mut self) -> Result<()> {
        let discard = self.handler.is_cancelled();
        self.close_parallel(discard)
    }

    fn close_parallel(&mut self, discard: bool) -> Result<()> {
        if self.phase != Phase::Parallel {
            return Err(Error::InvalidState("not in the parallel phase".into()));
        }
        self.phase = Phase::Sequential;
        self.handler.reset();

        let mode = if discard {
            MergeMode::Discard
        } else {
            self.config.merge_mode()
        };
        self.merge_locals(mode);
        tracing::debug!(?mode, unsatisfied = self.unsatisfied.len(), "left parallel phase");
        Ok(())
    }

    /// Run `body` inside a parallel phase
    ///
    /// The phase is always ended; thread-local results are merged only if
    /// `body` succeeded.
    pub fn parallel<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&ExecutionContext) -> Result<()>,
    {
        self.go_parallel()?;
        let outcome = body(self);
        self.close_parallel(outcome.is_err())?;
        outcome
    }

    /// Run `task` once per item
    ///
    /// In the parallel phase items are spread over the pool and each task
    /// gets its own thread's [`LocalResults`]. The first fatal error (or
    /// panic) cancels tasks that have not started and is returned once every
    /// started task has finished. In the sequential phase items run in order
    /// on the calling thread and the first error stops the loop.
    pub fn for_each_task<T, F>(&self, items: &[T], task: F) -> Result<()>
    where
        T: Sync,
        F: Fn(&ExecutionContext, &T, &mut LocalResults) -> Result<()> + Sync,
    {
        let pool = match (&self.pool, self.phase) {
            (Some(pool), Phase::Parallel) => pool,
            _ => {
                for item in items {
                    self.locals
                        .with(WorkerKey::Caller, |local| task(self, item, local))?;
                }
                return Ok(());
            }
        };

        pool.install(|| {
            items.par_iter().for_each(|item| {
                if self.handler.is_cancelled() {
                    return;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.locals
                        .with(WorkerKey::current(), |local| task(self, item, local))
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.handler.handle(e),
                    Err(payload) => {
                        self.handler
                            .handle(Error::TaskPanicked(panic_message(payload)))
                    }
                }
            })
        });
        self.await_completion()
    }

    /// Re-raise the fatal error captured during the phase, if any
    pub fn await_completion(&self) -> Result<()> {
        match self.handler.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fold every thread-local slot into the shared results
    pub fn merge_locals(&mut self, mode: MergeMode) {
        self.claims.get_mut().clear();
        for (_, local) in self.locals.drain() {
            if mode == MergeMode::Discard {
                continue;
            }
            for u in local.unsatisfied {
                self.push_unsatisfied(u, mode);
            }
            self.profiler.merge(&local.profiler);
            self.trace.extend(local.trace);
        }
    }

    /// Merge results computed elsewhere (another process) by union
    pub fn merge_remote(
        &mut self,
        unsatisfied: impl IntoIterator<Item = UnsatisfiedConstraint>,
        times: &Profiler,
    ) {
        for u in unsatisfied {
            self.push_unsatisfied(u, MergeMode::Union);
        }
        self.profiler.merge(times);
    }

    fn push_unsatisfied(&mut self, u: UnsatisfiedConstraint, mode: MergeMode) {
        match mode {
            MergeMode::Union => {
                if self.seen.insert(u.clone()) {
                    self.unsatisfied.push(u);
                }
            }
            MergeMode::Append => {
                self.seen.insert(u.clone());
                self.unsatisfied.push(u);
            }
            MergeMode::Discard => {}
        }
    }

    /// Take the merged unsatisfied constraints, leaving the set empty
    pub fn take_unsatisfied(&mut self) -> Vec<UnsatisfiedConstraint> {
        self.seen.clear();
        std::mem::take(&mut self.unsatisfied)
    }

    /// Take the merged execution times, leaving them empty
    pub fn take_profiler(&mut self) -> Profiler {
        std::mem::take(&mut self.profiler)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
