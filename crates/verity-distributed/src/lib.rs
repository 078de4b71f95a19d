//! Verity Distributed - Master/worker validation over a message broker
//!
//! A master and any number of workers validate the same script against the
//! same models. Each process enumerates the job list itself, so work is
//! handed out as index ranges rather than as the jobs themselves.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐                 ┌────────────────────────┐
//! │          Master          │                 │         Worker         │
//! │  ┌────────────────────┐  │  registration   │  ┌──────────────────┐  │
//! │  │   WorkerRegistry   │◀─┼─────────────────┼──│ RunConfiguration │  │
//! │  └────────────────────┘  │  config + sum   │  └──────────────────┘  │
//! │  ┌────────────────────┐  ├────────────────▶│           │            │
//! │  │     BatchPlan      │  │  batches/atoms  │           ▼            │
//! │  └────────────────────┘  ├────────────────▶│  ┌──────────────────┐  │
//! │  ┌────────────────────┐  │  results        │  │ ExecutionContext │  │
//! │  │  ExecutionContext  │◀─┼─────────────────┼──└──────────────────┘  │
//! │  └────────────────────┘  │                 │                        │
//! └──────────────────────────┘                 └────────────────────────┘
//!               all traffic goes through a Broker
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use verity_distributed::{
//!     DistributedConfig, InMemoryBroker, Master, ModelSource, RunConfiguration, Source,
//!     Worker, WorkerConfig,
//! };
//!
//! let broker = InMemoryBroker::new();
//! let run = RunConfiguration::new(
//!     Source::file("script.ron"),
//!     vec![ModelSource::new(Source::file("people.ron"))],
//! )
//! .with_base_path("data");
//!
//! let worker = Worker::new(broker.clone(), WorkerConfig::new("w1"));
//! let handle = std::thread::spawn(move || worker.run());
//!
//! let outcome = Master::new(broker, run, DistributedConfig::new(1)).run()?;
//! handle.join().unwrap()?;
//! println!("{} unsatisfied", outcome.report.unsatisfied.len());
//! ```

mod broker;
mod config;
mod dispatch;
mod error;
mod master;
mod memory;
mod protocol;
mod registry;
mod worker;

pub use broker::{Broker, Destination, Message, MessageProperties};
pub use config::{
    DispatchMode, DistributedConfig, LoadedRun, ModelSource, RunConfiguration, Source,
    WorkerConfig,
};
pub use dispatch::BatchPlan;
pub use error::{Error, Result};
pub use master::{Master, MasterReport};
pub use memory::{InMemoryBroker, MemoryBrokerError};
pub use protocol::{ConfigReply, JobPayload, QueueNames, ReadyReport, ResultPayload};
pub use registry::{WorkerRecord, WorkerRegistry};
pub use worker::{Worker, WorkerReport};
