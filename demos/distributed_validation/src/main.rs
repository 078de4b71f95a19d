//! Distributed Validation Demo
//!
//! Runs a master and several workers on threads of one process, connected
//! through the in-memory broker, and validates the sample people model in
//! `data/`. Afterwards the fixes of the failed constraints are applied to
//! the master's copy of the model.
//!
//! ## Settings
//!
//! Read from the environment:
//! - `WORKERS`: number of workers (default 3)
//! - `BATCHES`: batches per worker, `0` sends atoms (default 2)
//! - `DISPATCH`: `sync` (default) or `async`
//! - `RUST_LOG`: log filter

use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verity_distributed::{
    DispatchMode, DistributedConfig, InMemoryBroker, Master, ModelSource, RunConfiguration,
    Source, Worker, WorkerConfig,
};
use verity_engine::apply_fixes;

fn setting<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distributed_validation=info,verity_distributed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "demo failed");
        std::process::exit(1);
    }
}

fn run() -> verity_distributed::Result<()> {
    println!("=== Verity Distributed Validation Demo ===\n");

    let data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data");
    let workers: usize = setting("WORKERS", 3);
    let batches: usize = setting("BATCHES", 2);
    let dispatch = match std::env::var("DISPATCH").as_deref() {
        Ok("async") => DispatchMode::Asynchronous,
        _ => DispatchMode::Synchronous,
    };

    let run = RunConfiguration::new(
        Source::file("script.ron"),
        vec![ModelSource::new(Source::file("people.ron")).with_metamodel("people.mm.ron")],
    )
    .with_base_path(&data)
    .with_parameter("max_people=50")
    .with_local_parallelism(2)
    .with_distributed_parallelism(workers)
    .with_batches_per_worker(batches);

    println!(
        "Workers: {}, batches per worker: {}, dispatch: {:?}\n",
        workers, batches, dispatch
    );

    let broker = InMemoryBroker::new();
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let worker = Worker::new(
                broker.clone(),
                WorkerConfig::new(format!("worker-{}", i)).with_base_path(&data),
            );
            thread::spawn(move || worker.run())
        })
        .collect();

    let config = DistributedConfig::new(workers)
        .with_dispatch(dispatch)
        .with_registration_timeout(Duration::from_secs(10))
        .with_completion_timeout(Duration::from_secs(10));
    let outcome = Master::new(broker, run.clone(), config).run()?;

    for handle in handles {
        match handle.join() {
            Ok(Ok(report)) => println!(
                "  {}: {} payloads processed, {} returned",
                report.worker_id, report.processed, report.unprocessed
            ),
            Ok(Err(e)) => tracing::warn!(error = %e, "worker ended with an error"),
            Err(_) => tracing::warn!("worker thread panicked"),
        }
    }
    if outcome.locally_recovered > 0 {
        println!("  master: {} jobs recovered locally", outcome.locally_recovered);
    }

    let report = &outcome.report;
    println!(
        "\n{} jobs, {} unsatisfied, {} evaluation errors:",
        report.job_count,
        report.unsatisfied.len(),
        report.job_failures
    );
    for unsatisfied in report.sorted() {
        println!("  {}", unsatisfied);
    }

    println!("\nSlowest constraints:");
    for (name, elapsed) in report.execution_times.slowest().into_iter().take(3) {
        println!("  {:<28} {:?}", name, elapsed);
    }

    let loaded = run.load(None)?;
    let mut repository = loaded.repository;
    let mut variables = loaded.script.variables.clone();
    variables.extend(loaded.parameters);
    let fixes = apply_fixes(
        &loaded.script,
        &mut repository,
        &variables,
        &report.unsatisfied,
    )?;

    println!("\nApplied {} fixes:", fixes.len());
    for fix in &fixes {
        println!("  {} on {}: {}", fix.constraint, fix.element, fix.title);
    }

    println!("\n=== Demo Complete ===");
    Ok(())
}
