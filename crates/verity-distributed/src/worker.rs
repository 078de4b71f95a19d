//! Worker agent
//!
//! A worker registers with the master, loads the configuration it is sent,
//! verifies the checksum, and then evaluates job payloads from its private
//! queue until the master sends `End`:
//!
//! ```text
//! Registering ─▶ AwaitingConfig ─▶ Configuring ─▶ Ready ─▶ Processing ─▶ Completed
//!                  │                  │                          │
//!                  └─ Rejected        └─ Failed (reported)       └─ stop: abandon
//! ```
//!
//! Every payload is answered with exactly one result message. A payload
//! that cannot be evaluated is returned as `Unprocessed` for the master to
//! redo. Any error that ends the loop early is still reported through a
//! terminal completion message carrying the failure.
//!
//! The correlation id of the configuration names the master's run. The
//! worker echoes it on everything it sends, and ignores payloads or stop
//! messages stamped for another run.

use crate::broker::{Broker, Destination, Message};
use crate::config::{RunConfiguration, WorkerConfig};
use crate::error::{Error, Result};
use crate::protocol::{ConfigReply, JobPayload, QueueNames, ReadyReport, ResultPayload};
use verity_engine::hash::checksum32;
use verity_engine::{evaluate, evaluate_jobs, ExecutionContext, Profiler};

/// Summary of a worker's run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Payloads evaluated
    pub processed: usize,
    /// Payloads returned to the master
    pub unprocessed: usize,
    /// The master published a stop before the worker finished
    pub stopped: bool,
    pub execution_times: Profiler,
}

/// A worker bound to a broker
pub struct Worker<B: Broker> {
    broker: B,
    config: WorkerConfig,
    names: QueueNames,
}

impl<B: Broker> Worker<B> {
    pub fn new(broker: B, config: WorkerConfig) -> Self {
        let names = QueueNames::new(config.session.as_deref());
        Self {
            broker,
            config,
            names,
        }
    }

    /// The id this worker asks to register under
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker to completion
    ///
    /// Returns an error if the worker was rejected, never received its
    /// configuration, or could not be configured.
    pub fn run(&self) -> Result<WorkerReport> {
        let reply = self.broker.create_temporary_queue().map_err(Error::broker)?;
        let stop = self
            .broker
            .subscribe(&self.names.stop_topic())
            .map_err(Error::broker)?;

        let outcome = self.session(&reply, &stop);

        for destination in [&reply, &stop] {
            if let Err(e) = self.broker.delete(destination) {
                tracing::debug!(%destination, error = %e, "worker cleanup failed");
            }
        }
        match &outcome {
            Ok(report) => tracing::info!(
                worker = %report.worker_id,
                processed = report.processed,
                unprocessed = report.unprocessed,
                stopped = report.stopped,
                "worker finished"
            ),
            Err(e) => tracing::error!(worker = %self.id(), error = %e, "worker failed"),
        }
        outcome
    }

    fn session(&self, reply: &Destination, stop: &Destination) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            worker_id: self.id().to_string(),
            ..WorkerReport::default()
        };

        let registration = Message::new(Vec::new())
            .with_worker(self.id())
            .with_reply_to(reply.clone());
        self.send(&self.names.registration(), registration)?;
        tracing::debug!(worker = %self.id(), "registered");

        let sources = [reply.clone(), stop.clone()];
        let (from, message) = self
            .broker
            .receive_any(&sources, self.config.config_timeout)
            .map_err(Error::broker)?
            .ok_or_else(|| Error::Timeout("the run configuration".into()))?;
        if from == *stop {
            report.stopped = true;
            return Ok(report);
        }

        let bytes = match message.decode::<ConfigReply>()? {
            ConfigReply::Configuration(bytes) => bytes,
            ConfigReply::Rejected(reason) => return Err(Error::Rejected(reason)),
        };
        // The master may rename a worker whose requested id is taken
        if let Some(assigned) = &message.properties.worker_id {
            report.worker_id = assigned.clone();
        }
        let id = report.worker_id.clone();
        let run = message.correlation_id.as_deref();

        let checksum = match verify(&message, &bytes) {
            Ok(checksum) => checksum,
            Err(e) => return self.refuse(&id, run, e),
        };
        let mut ctx = match self.configure(&bytes) {
            Ok(ctx) => ctx,
            Err(e) => return self.refuse(&id, run, e),
        };

        let ready = Message::encode(&ReadyReport::Ready)?
            .with_worker(id.as_str())
            .with_checksum(checksum);
        self.send(&self.names.ready(), stamp(ready, run))?;
        tracing::info!(worker = %id, ?run, jobs = ctx.jobs().len(), "configured");

        let outcome = self.process(&mut ctx, &id, run, stop, &mut report);
        if report.stopped {
            tracing::warn!(worker = %id, "stop received, abandoning work");
            return Ok(report);
        }

        report.execution_times = ctx.take_profiler();
        let completion = ResultPayload::Completion {
            execution_times: report.execution_times.clone(),
            failure: outcome.as_ref().err().map(ToString::to_string),
        };
        let sent = Message::encode(&completion).and_then(|message| {
            let message = stamp(message.with_worker(id.as_str()).last(), run);
            self.send(&self.names.results(), message)
        });
        outcome?;
        sent?;
        Ok(report)
    }

    fn configure(&self, bytes: &[u8]) -> Result<ExecutionContext> {
        RunConfiguration::decode(bytes)?.context(self.config.base_path.as_deref())
    }

    /// Report a configuration failure to the master and give up
    fn refuse(&self, id: &str, run: Option<&str>, error: Error) -> Result<WorkerReport> {
        let failed = Message::encode(&ReadyReport::Failed(error.to_string()))?.with_worker(id);
        self.send(&self.names.ready(), stamp(failed, run))?;
        Err(error)
    }

    fn process(
        &self,
        ctx: &mut ExecutionContext,
        id: &str,
        run: Option<&str>,
        stop: &Destination,
        report: &mut WorkerReport,
    ) -> Result<()> {
        let sources = [self.names.jobs(id), stop.clone()];
        loop {
            let (from, message) = self
                .broker
                .receive_any(&sources, self.config.job_wait_timeout)
                .map_err(Error::broker)?
                .ok_or_else(|| Error::Timeout("job payloads".into()))?;
            let foreign = matches!(
                (run, message.correlation_id.as_deref()),
                (Some(ours), Some(theirs)) if ours != theirs
            );
            if from == *stop {
                if foreign {
                    tracing::debug!(worker = %id, "stop for another run ignored");
                    continue;
                }
                report.stopped = true;
                return Ok(());
            }
            if foreign || (run.is_some() && message.correlation_id.is_none()) {
                tracing::warn!(
                    worker = %id,
                    run = ?message.correlation_id,
                    "payload from another run ignored"
                );
                continue;
            }

            let payload: JobPayload = message.decode()?;
            let jobs = ctx.jobs();
            let outcome = match payload {
                JobPayload::End => return Ok(()),
                JobPayload::Batch(batch) => evaluate(batch, &jobs, ctx),
                JobPayload::Atom(job) => evaluate_jobs(&[job], ctx),
            };
            let result = match outcome {
                Ok(unsatisfied) => {
                    report.processed += 1;
                    ResultPayload::Results {
                        job: payload,
                        unsatisfied,
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %id, %payload, error = %e, "returning unprocessed");
                    report.unprocessed += 1;
                    ResultPayload::Unprocessed(payload)
                }
            };
            let message = Message::encode(&result)?.with_worker(id);
            self.send(&self.names.results(), stamp(message, run))?;
        }
    }

    fn send(&self, destination: &Destination, message: Message) -> Result<()> {
        self.broker
            .send(destination, message)
            .map_err(Error::broker)
    }
}

/// Echo the run id, when the master sent one
fn stamp(message: Message, run: Option<&str>) -> Message {
    match run {
        Some(run) => message.with_correlation_id(run),
        None => message,
    }
}

/// Check the received bytes against the checksum the master sent
fn verify(message: &Message, bytes: &[u8]) -> Result<u32> {
    let expected = message
        .properties
        .config_checksum
        .ok_or_else(|| Error::Protocol("configuration without checksum".into()))?;
    let actual = checksum32(bytes);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSource, Source};
    use crate::memory::InMemoryBroker;
    use std::thread;
    use std::time::Duration;
    use verity_engine::Batch;

    const WAIT: Duration = Duration::from_secs(10);

    const SCRIPT: &str = r#"(contexts: [(kind: Some("Person"), constraints: [
        (name: "NameNotEmpty", check: Ne(Property("name"), Literal(String("")))),
    ])])"#;

    const MODEL: &str = r#"(elements: [
        (id: 0, kind: "Person", properties: { "name": String("Ann") }),
        (id: 1, kind: "Person", properties: { "name": String("") }),
        (id: 2, kind: "Person", properties: { "name": String("Bo") }),
    ])"#;

    fn run_config() -> RunConfiguration {
        RunConfiguration::new(
            Source::inline("script.ron", SCRIPT),
            vec![ModelSource::new(Source::inline("people", MODEL))],
        )
        .with_local_parallelism(1)
    }

    /// Start a worker and take its registration off the queue, playing master
    fn start(
        broker: &InMemoryBroker,
    ) -> (thread::JoinHandle<Result<WorkerReport>>, Destination) {
        let worker = Worker::new(
            broker.clone(),
            WorkerConfig::new("w1")
                .with_config_timeout(WAIT)
                .with_job_wait_timeout(WAIT),
        );
        let handle = thread::spawn(move || worker.run());
        let names = QueueNames::new(None);
        let registration = broker
            .receive(&names.registration(), WAIT)
            .unwrap()
            .unwrap();
        assert_eq!(registration.properties.worker_id.as_deref(), Some("w1"));
        (handle, registration.reply_to.unwrap())
    }

    const RUN: &str = "run-1";

    fn configuration(bytes: Vec<u8>, checksum: u32) -> Message {
        Message::encode(&ConfigReply::Configuration(bytes))
            .unwrap()
            .with_worker("w1")
            .with_checksum(checksum)
            .with_correlation_id(RUN)
    }

    fn job(payload: &JobPayload) -> Message {
        Message::encode(payload).unwrap().with_correlation_id(RUN)
    }

    fn next_result(broker: &InMemoryBroker) -> Message {
        broker
            .receive(&QueueNames::new(None).results(), WAIT)
            .unwrap()
            .unwrap()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    #[test]
    fn test_checksum_mismatch_refuses_to_confirm() {
        let broker = InMemoryBroker::new();
        let (handle, reply) = start(&broker);

        let bytes = run_config().encode().unwrap();
        let wrong = checksum32(&bytes) ^ 1;
        broker.send(&reply, configuration(bytes, wrong)).unwrap();

        let ready = broker
            .receive(&QueueNames::new(None).ready(), WAIT)
            .unwrap()
            .unwrap();
        match ready.decode::<ReadyReport>().unwrap() {
            ReadyReport::Failed(reason) => assert!(reason.contains("checksum"), "{}", reason),
            ReadyReport::Ready => panic!("worker confirmed a foreign configuration"),
        }
        assert!(matches!(
            handle.join().unwrap(),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejected_registration() {
        let broker = InMemoryBroker::new();
        let (handle, reply) = start(&broker);
        let rejected = Message::encode(&ConfigReply::Rejected("full".into())).unwrap();
        broker.send(&reply, rejected).unwrap();

        assert!(matches!(handle.join().unwrap(), Err(Error::Rejected(r)) if r == "full"));
    }

    #[test]
    fn test_stop_before_configuration() {
        let broker = InMemoryBroker::new();
        let (handle, _) = start(&broker);
        broker
            .send(&QueueNames::new(None).stop(), Message::new(Vec::new()))
            .unwrap();

        let report = handle.join().unwrap().unwrap();
        assert!(report.stopped);
        assert_eq!(report.processed, 0);
    }

    // ========================================================================
    // Processing
    // ========================================================================

    #[test]
    fn test_every_payload_is_answered() {
        let broker = InMemoryBroker::new();
        let (handle, reply) = start(&broker);
        let names = QueueNames::new(None);

        let bytes = run_config().encode().unwrap();
        let checksum = checksum32(&bytes);
        broker.send(&reply, configuration(bytes, checksum)).unwrap();

        let ready = broker.receive(&names.ready(), WAIT).unwrap().unwrap();
        assert_eq!(ready.decode::<ReadyReport>().unwrap(), ReadyReport::Ready);
        assert_eq!(ready.properties.config_checksum, Some(checksum));
        assert_eq!(ready.correlation_id.as_deref(), Some(RUN));

        let jobs = names.jobs("w1");
        let good = JobPayload::Batch(Batch::new(0, 3));
        let bad = JobPayload::Batch(Batch::new(2, 9));
        for payload in [good, bad, JobPayload::End] {
            broker.send(&jobs, job(&payload)).unwrap();
        }

        match next_result(&broker).decode::<ResultPayload>().unwrap() {
            ResultPayload::Results { job, unsatisfied } => {
                assert_eq!(job, good);
                assert_eq!(unsatisfied.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            next_result(&broker).decode::<ResultPayload>().unwrap(),
            ResultPayload::Unprocessed(bad)
        );
        let last = next_result(&broker);
        assert!(last.properties.last_message);
        assert_eq!(last.correlation_id.as_deref(), Some(RUN));
        match last.decode::<ResultPayload>().unwrap() {
            ResultPayload::Completion {
                execution_times,
                failure,
            } => {
                assert!(failure.is_none());
                assert!(execution_times.get("Person.NameNotEmpty").is_some());
            }
            other => panic!("unexpected {:?}", other),
        }

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.unprocessed, 1);
    }

    #[test]
    fn test_atoms_and_assigned_id() {
        let broker = InMemoryBroker::new();
        let (handle, reply) = start(&broker);
        let names = QueueNames::new(None);

        let config = run_config();
        let ctx = config.context(None).unwrap();
        let bytes = config.encode().unwrap();
        let checksum = checksum32(&bytes);
        let renamed = configuration(bytes, checksum).with_worker("worker-4");
        broker.send(&reply, renamed).unwrap();
        broker.receive(&names.ready(), WAIT).unwrap().unwrap();

        let jobs = names.jobs("worker-4");
        for atom in ctx.jobs().iter() {
            broker.send(&jobs, job(&JobPayload::Atom(*atom))).unwrap();
        }
        broker.send(&jobs, job(&JobPayload::End)).unwrap();

        let mut failures = 0;
        for _ in 0..3 {
            let message = next_result(&broker);
            assert_eq!(message.properties.worker_id.as_deref(), Some("worker-4"));
            let payload: ResultPayload = message.decode().unwrap();
            if let ResultPayload::Results { unsatisfied, .. } = payload {
                failures += unsatisfied.len();
            }
        }
        assert_eq!(failures, 1);
        assert!(next_result(&broker).properties.last_message);

        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.worker_id, "worker-4");
        assert_eq!(report.processed, 3);
    }

    #[test]
    fn test_payloads_and_stop_from_another_run_are_ignored() {
        let broker = InMemoryBroker::new();
        let (handle, reply) = start(&broker);
        let names = QueueNames::new(None);

        let bytes = run_config().encode().unwrap();
        let checksum = checksum32(&bytes);
        broker.send(&reply, configuration(bytes, checksum)).unwrap();
        broker.receive(&names.ready(), WAIT).unwrap().unwrap();

        let jobs = names.jobs("w1");
        let stale = JobPayload::Batch(Batch::new(0, 1));
        let older = Message::encode(&stale)
            .unwrap()
            .with_correlation_id("run-0");
        broker.send(&jobs, older).unwrap();
        broker.send(&jobs, Message::encode(&stale).unwrap()).unwrap();
        let old_stop = Message::new(Vec::new()).with_correlation_id("run-0");
        broker.send(&names.stop(), old_stop).unwrap();
        broker
            .send(&jobs, job(&JobPayload::Batch(Batch::new(0, 3))))
            .unwrap();

        let first = next_result(&broker);
        assert!(matches!(
            first.decode::<ResultPayload>().unwrap(),
            ResultPayload::Results { job: JobPayload::Batch(b), .. } if b == Batch::new(0, 3)
        ));
        // With the jobs queue empty the worker reads the old stop and carries on
        broker.send(&jobs, job(&JobPayload::End)).unwrap();
        assert!(next_result(&broker).properties.last_message);

        let report = handle.join().unwrap().unwrap();
        assert!(!report.stopped);
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn test_job_wait_timeout_reports_failure() {
        let broker = InMemoryBroker::new();
        let worker = Worker::new(
            broker.clone(),
            WorkerConfig::new("w1")
                .with_config_timeout(WAIT)
                .with_job_wait_timeout(Duration::from_millis(50)),
        );
        let handle = thread::spawn(move || worker.run());
        let names = QueueNames::new(None);
        let registration = broker.receive(&names.registration(), WAIT).unwrap().unwrap();

        let bytes = run_config().encode().unwrap();
        let checksum = checksum32(&bytes);
        broker
            .send(&registration.reply_to.unwrap(), configuration(bytes, checksum))
            .unwrap();

        let last = next_result(&broker);
        assert!(last.properties.last_message);
        assert!(matches!(
            last.decode::<ResultPayload>().unwrap(),
            ResultPayload::Completion { failure: Some(_), .. }
        ));
        assert!(matches!(handle.join().unwrap(), Err(Error::Timeout(_))));
    }
}
