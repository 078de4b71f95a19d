//! Master coordinator
//!
//! The master owns the run. It loads the configuration itself, hands it to
//! every worker that registers, splits the job list into a fixed plan, and
//! evaluates its own share while the workers evaluate theirs:
//!
//! ```text
//! AwaitingRegistrations ─▶ Dispatching ─▶ AwaitingCompletion ─▶ Merging ─▶ Done
//!  (configure, confirm)     (sync: all     (results, returns,    (failed and
//!                            async: each)   completions)          unclaimed work)
//! ```
//!
//! Work never moves between workers. Anything a worker returns unprocessed,
//! still held when it fails, or never claimed because a worker did not show
//! up, is evaluated by the master after the workers are done.
//!
//! Every run gets a fresh id, carried as the correlation id of the
//! configuration, of every job payload and of the stop message. Workers echo
//! it back; confirmations and results carrying another id, or coming from a
//! worker this run never registered, are dropped. When the run ends the
//! master deletes the queues it used, so nothing it leaves behind reaches the
//! next run on the same broker.

use crate::broker::{Broker, Destination, Message};
use crate::config::{DispatchMode, DistributedConfig, RunConfiguration};
use crate::dispatch::BatchPlan;
use crate::error::{Error, Result};
use crate::protocol::{ConfigReply, JobPayload, QueueNames, ReadyReport, ResultPayload};
use crate::registry::{WorkerRecord, WorkerRegistry};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use verity_core::UnsatisfiedConstraint;
use verity_engine::hash::checksum32;
use verity_engine::{evaluate, evaluate_jobs, Job, Profiler, ValidationReport};

/// Outcome of a distributed run
#[derive(Debug, Clone)]
pub struct MasterReport {
    /// Merged results of the master and every worker
    pub report: ValidationReport,
    /// Final state of every registered worker
    pub workers: Vec<WorkerRecord>,
    /// Jobs the master evaluated on behalf of missing or failed workers
    pub locally_recovered: usize,
    /// Correlation id stamped on this run's messages
    pub run_id: String,
}

/// A process-unique id for one run
fn new_run_id() -> String {
    static RUNS: AtomicU64 = AtomicU64::new(0);
    format!(
        "run-{:x}-{}",
        Utc::now().timestamp_micros(),
        RUNS.fetch_add(1, Ordering::Relaxed)
    )
}

/// Per-run state shared by the coordination steps
struct Session<'r> {
    run_id: &'r str,
    registry: &'r mut WorkerRegistry,
    plan: BatchPlan,
    jobs: Arc<Vec<Job>>,
    bytes: Vec<u8>,
    checksum: u32,
    /// Set once the registration phase is over
    gathered: bool,
    /// Payloads to redo locally
    failed: Vec<JobPayload>,
    results: Vec<UnsatisfiedConstraint>,
    times: Profiler,
}

impl Session<'_> {
    /// Whether a message was sent by a worker of this run
    fn accepts(&self, message: &Message) -> bool {
        let ours = message.correlation_id.as_deref() == Some(self.run_id);
        match &message.properties.worker_id {
            Some(id) if ours && self.registry.contains(id) => true,
            id => {
                tracing::warn!(
                    worker = ?id,
                    run = ?message.correlation_id,
                    "message from outside this run ignored"
                );
                false
            }
        }
    }

    /// The requested id if it is free, otherwise a generated one
    fn assign_id(&self, requested: Option<&str>) -> String {
        if let Some(id) = requested.filter(|id| !self.registry.contains(id)) {
            return id.to_string();
        }
        let mut n = self.registry.len();
        loop {
            let id = format!("worker-{}", n);
            if !self.registry.contains(&id) {
                return id;
            }
            n += 1;
        }
    }
}

/// The coordinating side of a distributed run
pub struct Master<B: Broker> {
    broker: B,
    run: RunConfiguration,
    config: DistributedConfig,
    names: QueueNames,
}

impl<B: Broker> Master<B> {
    pub fn new(broker: B, run: RunConfiguration, config: DistributedConfig) -> Self {
        let names = QueueNames::new(config.session.as_deref());
        Self {
            broker,
            run,
            config,
            names,
        }
    }

    /// Run to completion and merge every result
    ///
    /// The stop topic is published when the run ends, so workers still
    /// waiting on this master give up.
    pub fn run(&self) -> Result<MasterReport> {
        let run_id = new_run_id();
        let mut registry = WorkerRegistry::new();
        let outcome = self.coordinate(&run_id, &mut registry);
        if let Err(e) = &outcome {
            tracing::error!(run = %run_id, error = %e, "distributed run failed");
        }
        self.teardown(&run_id, &registry);
        outcome
    }

    fn coordinate(&self, run_id: &str, registry: &mut WorkerRegistry) -> Result<MasterReport> {
        let bytes = self.run.encode()?;
        let checksum = checksum32(&bytes);
        let mut ctx = self.run.context(None)?;
        let jobs = ctx.jobs();

        let mut session = Session {
            run_id,
            registry,
            plan: BatchPlan::new(
                jobs.len(),
                self.config.expected_workers,
                self.run.batches_per_worker,
            ),
            jobs: Arc::clone(&jobs),
            bytes,
            checksum,
            gathered: false,
            failed: Vec::new(),
            results: Vec::new(),
            times: Profiler::new(),
        };
        tracing::info!(
            run = %run_id,
            jobs = jobs.len(),
            workers = self.config.expected_workers,
            batches = session.plan.batches().len(),
            atoms = session.plan.is_atomic(),
            checksum = format_args!("{:#010x}", checksum),
            "master started"
        );

        let own_share = session.plan.master_share();
        let (flow, own) = thread::scope(|scope| {
            let ctx = &mut ctx;
            let jobs = Arc::clone(&jobs);
            let handle = scope.spawn(move || match own_share {
                Some(batch) => evaluate(batch, &jobs, ctx),
                None => Ok(Vec::new()),
            });

            let flow = self
                .gather(&mut session)
                .and_then(|()| self.dispatch_confirmed(&mut session))
                .and_then(|()| self.collect(&mut session));
            (flow, handle.join())
        });
        flow?;
        let own = own.map_err(|_| {
            verity_engine::Error::TaskPanicked("master share evaluation panicked".into())
        })??;

        let mut redo: Vec<Job> = Vec::new();
        for payload in std::mem::take(&mut session.failed) {
            match payload {
                JobPayload::Batch(batch) => {
                    redo.extend_from_slice(batch.slice(jobs.as_slice())?)
                }
                JobPayload::Atom(job) => redo.push(job),
                JobPayload::End => {}
            }
        }
        for batch in session.plan.unclaimed() {
            redo.extend_from_slice(batch.slice(jobs.as_slice())?);
        }
        let recovered = if redo.is_empty() {
            Vec::new()
        } else {
            tracing::info!(jobs = redo.len(), "evaluating recovered work locally");
            evaluate_jobs(&redo, &mut ctx)?
        };

        ctx.merge_remote(
            own.into_iter()
                .chain(std::mem::take(&mut session.results))
                .chain(recovered),
            &session.times,
        );
        let report = ValidationReport::from_context(ctx);
        tracing::info!(
            unsatisfied = report.unsatisfied.len(),
            job_failures = report.job_failures,
            recovered = redo.len(),
            "distributed run complete"
        );

        Ok(MasterReport {
            report,
            workers: session.registry.records(),
            locally_recovered: redo.len(),
            run_id: run_id.to_string(),
        })
    }

    fn sources(&self) -> [Destination; 3] {
        [
            self.names.registration(),
            self.names.ready(),
            self.names.results(),
        ]
    }

    /// Wait until the expected workers are confirmed or the registration
    /// timeout elapses
    fn gather(&self, session: &mut Session) -> Result<()> {
        let sources = self.sources();
        let deadline = Instant::now() + self.config.registration_timeout;
        while session.registry.confirmed_count() < self.config.expected_workers {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    confirmed = session.registry.confirmed_count(),
                    expected = self.config.expected_workers,
                    "registration timed out, continuing with confirmed workers"
                );
                break;
            }
            let received = self
                .broker
                .receive_any(&sources, deadline - now)
                .map_err(Error::broker)?;
            if let Some((from, message)) = received {
                self.handle(session, &from, message)?;
            }
        }
        session.gathered = true;
        Ok(())
    }

    /// Dispatch to every confirmed worker that has no work yet
    fn dispatch_confirmed(&self, session: &mut Session) -> Result<()> {
        let waiting: Vec<String> = session
            .registry
            .iter()
            .filter(|r| r.is_confirmed() && !r.dispatched && r.alive)
            .map(|r| r.id.clone())
            .collect();
        for id in waiting {
            self.dispatch(session, &id)?;
        }
        Ok(())
    }

    /// Process messages until every dispatched worker completed or the
    /// results queue stays silent for the completion timeout
    fn collect(&self, session: &mut Session) -> Result<()> {
        let sources = self.sources();
        while !session.registry.all_finished() {
            let received = self
                .broker
                .receive_any(&sources, self.config.completion_timeout)
                .map_err(Error::broker)?;
            match received {
                Some((from, message)) => self.handle(session, &from, message)?,
                None => {
                    let silent: Vec<String> =
                        session.registry.pending().map(|r| r.id.clone()).collect();
                    for id in silent {
                        let held = session.registry.mark_lost(&id);
                        tracing::warn!(worker = %id, payloads = held.len(), "worker timed out");
                        session.failed.extend(held);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle(&self, session: &mut Session, from: &Destination, message: Message) -> Result<()> {
        if *from == self.names.registration() {
            self.on_registration(session, message)
        } else if *from == self.names.ready() {
            self.on_ready(session, message)
        } else {
            self.on_result(session, message);
            Ok(())
        }
    }

    fn on_registration(&self, session: &mut Session, message: Message) -> Result<()> {
        let Some(reply_to) = message.reply_to.clone() else {
            tracing::warn!("registration without a reply address ignored");
            return Ok(());
        };
        let open = session.registry.len() < self.config.expected_workers
            || self.config.accept_late_joiners;
        if !open {
            tracing::info!(
                requested = ?message.properties.worker_id,
                "registration rejected, worker count reached"
            );
            let rejected = ConfigReply::Rejected("expected worker count reached".into());
            return self.send(&reply_to, Message::encode(&rejected)?);
        }

        let id = session.assign_id(message.properties.worker_id.as_deref());
        session.registry.register(&id);
        let reply = Message::encode(&ConfigReply::Configuration(session.bytes.clone()))?
            .with_worker(id.as_str())
            .with_checksum(session.checksum)
            .with_correlation_id(session.run_id);
        // A worker that gave up before its registration was read is gone
        if let Err(e) = self.send(&reply_to, reply) {
            tracing::warn!(
                worker = %id,
                error = %e,
                "configuration undeliverable, registration dropped"
            );
            session.registry.remove(&id);
            return Ok(());
        }
        tracing::debug!(worker = %id, "registered, configuration sent");
        Ok(())
    }

    fn on_ready(&self, session: &mut Session, message: Message) -> Result<()> {
        let Some(id) = message.properties.worker_id.clone() else {
            tracing::warn!("confirmation without a worker id ignored");
            return Ok(());
        };
        if !session.accepts(&message) {
            return Ok(());
        }
        match message.decode::<ReadyReport>() {
            Ok(ReadyReport::Ready) => {}
            Ok(ReadyReport::Failed(reason)) => {
                return Err(Error::WorkerConfiguration { worker: id, reason })
            }
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "undecodable confirmation ignored");
                return Ok(());
            }
        }
        if message.properties.config_checksum != Some(session.checksum) {
            return Err(Error::WorkerConfiguration {
                worker: id,
                reason: "confirmed a different configuration".into(),
            });
        }
        if !session.registry.confirm(&id) {
            return Ok(());
        }
        tracing::info!(worker = %id, "worker ready");

        if self.config.dispatch == DispatchMode::Asynchronous || session.gathered {
            self.dispatch(session, &id)?;
        }
        Ok(())
    }

    fn on_result(&self, session: &mut Session, message: Message) {
        let Some(id) = message.properties.worker_id.clone() else {
            tracing::warn!("result without a worker id ignored");
            return;
        };
        if !session.accepts(&message) {
            return;
        }
        // Anything unreadable stays outstanding and is recovered at completion
        let payload = match message.decode::<ResultPayload>() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "undecodable result ignored");
                session.registry.touch(&id);
                return;
            }
        };
        // Only the terminal message may carry the completion report
        let last = message.properties.last_message;
        if last != matches!(payload, ResultPayload::Completion { .. }) {
            tracing::warn!(worker = %id, last, "last message flag disagrees with the body");
            session.registry.touch(&id);
            return;
        }
        match payload {
            ResultPayload::Results { job, unsatisfied } => {
                tracing::debug!(worker = %id, %job, unsatisfied = unsatisfied.len(), "results");
                session.registry.acknowledge(&id, &job);
                session.results.extend(unsatisfied);
            }
            ResultPayload::Unprocessed(job) => {
                tracing::warn!(worker = %id, %job, "job returned unprocessed");
                session.registry.acknowledge(&id, &job);
                session.failed.push(job);
            }
            ResultPayload::Completion {
                execution_times,
                failure,
            } => {
                if let Some(reason) = &failure {
                    tracing::warn!(worker = %id, failure = %reason, "worker failed");
                } else {
                    tracing::info!(worker = %id, "worker completed");
                }
                session.times.merge(&execution_times);
                let held = session.registry.complete(&id, execution_times, failure);
                session.failed.extend(held);
                tracing::debug!(
                    completed = session.registry.iter().filter(|r| r.completed).count(),
                    workers = session.registry.len(),
                    "last messages received"
                );
            }
        }
    }

    /// Send a worker its share followed by `End`
    ///
    /// Payloads that cannot be sent are kept for local evaluation.
    fn dispatch(&self, session: &mut Session, id: &str) -> Result<()> {
        let share = session.plan.next_share();
        let payloads = session.plan.payloads(&share, &session.jobs)?;
        let queue = self.names.jobs(id);

        let mut sent = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match self.send_payload(session, &queue, payload) {
                Ok(()) => sent.push(payload),
                Err(e) => {
                    tracing::warn!(worker = %id, %payload, error = %e, "dispatch failed");
                    session.failed.push(payload);
                }
            }
        }
        session.registry.assign(id, &sent);
        tracing::debug!(worker = %id, payloads = sent.len(), "dispatched");

        if let Err(e) = self.send_payload(session, &queue, JobPayload::End) {
            tracing::warn!(worker = %id, error = %e, "could not end dispatch, dropping worker");
            let held = session.registry.mark_lost(id);
            session.failed.extend(held);
        }
        Ok(())
    }

    fn send_payload(
        &self,
        session: &Session,
        queue: &Destination,
        payload: JobPayload,
    ) -> Result<()> {
        let message = Message::encode(&payload)?.with_correlation_id(session.run_id);
        self.send(queue, message)
    }

    fn send(&self, destination: &Destination, message: Message) -> Result<()> {
        self.broker
            .send(destination, message)
            .map_err(Error::broker)
    }

    /// Publish stop and release everything this run used on the broker
    ///
    /// Registrations still queued are turned away so their workers do not
    /// wait for a configuration that will never come.
    fn teardown(&self, run_id: &str, registry: &WorkerRegistry) {
        let stop = Message::new(Vec::new()).with_correlation_id(run_id);
        if let Err(e) = self.broker.send(&self.names.stop(), stop) {
            tracing::debug!(error = %e, "stop not published");
        }

        let registration = self.names.registration();
        while let Ok(Some(message)) = self.broker.receive(&registration, Duration::ZERO) {
            let Some(reply_to) = message.reply_to else { continue };
            let turned_away = Message::encode(&ConfigReply::Rejected("the run has finished".into()))
                .and_then(|reply| self.send(&reply_to, reply));
            if let Err(e) = turned_away {
                tracing::debug!(error = %e, "late registration not answered");
            }
        }

        let queues = registry
            .iter()
            .map(|r| self.names.jobs(&r.id))
            .chain([self.names.ready(), self.names.results()]);
        for queue in queues {
            if let Err(e) = self.broker.delete(&queue) {
                tracing::debug!(%queue, error = %e, "queue not deleted");
            }
        }

        if self.config.owns_broker {
            if let Err(e) = self.broker.close() {
                tracing::warn!(error = %e, "broker did not close cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSource, Source, WorkerConfig};
    use crate::memory::InMemoryBroker;
    use crate::worker::{Worker, WorkerReport};

    const SCRIPT: &str = r#"(contexts: [(kind: Some("Person"), constraints: [
        (name: "NameNotEmpty", check: Ne(Property("name"), Literal(String("")))),
    ])])"#;

    const WAIT: Duration = Duration::from_secs(10);

    /// Ten people; elements 3 and 7 have empty names
    fn model() -> String {
        let elements: Vec<String> = (0..10)
            .map(|i| {
                let name = if i == 3 || i == 7 { String::new() } else { format!("p{}", i) };
                format!(
                    r#"(id: {}, kind: "Person", properties: {{ "name": String("{}") }})"#,
                    i, name
                )
            })
            .collect();
        format!("(name: Some(\"people\"), elements: [{}])", elements.join(", "))
    }

    fn run_config(batches_per_worker: usize) -> RunConfiguration {
        RunConfiguration::new(
            Source::inline("script.ron", SCRIPT),
            vec![ModelSource::new(Source::inline("people", model()))],
        )
        .with_local_parallelism(2)
        .with_batches_per_worker(batches_per_worker)
    }

    fn distributed(workers: usize) -> DistributedConfig {
        DistributedConfig::new(workers)
            .with_registration_timeout(WAIT)
            .with_completion_timeout(WAIT)
    }

    fn spawn_worker(
        broker: &InMemoryBroker,
        id: &str,
    ) -> thread::JoinHandle<Result<WorkerReport>> {
        let worker = Worker::new(
            broker.clone(),
            WorkerConfig::new(id)
                .with_config_timeout(WAIT)
                .with_job_wait_timeout(WAIT),
        );
        thread::spawn(move || worker.run())
    }

    fn failing_ids(report: &MasterReport) -> Vec<u64> {
        let mut ids: Vec<u64> = report
            .report
            .unsatisfied
            .iter()
            .filter_map(|u| u.element.as_ref().map(|e| e.element.raw()))
            .collect();
        ids.sort();
        ids
    }

    /// Queue a registration for `id` as a worker without an engine would
    fn register_by_hand(broker: &InMemoryBroker, id: &str) -> Destination {
        let reply = broker.create_temporary_queue().unwrap();
        let registration = Message::new(Vec::new())
            .with_worker(id)
            .with_reply_to(reply.clone());
        broker
            .send(&QueueNames::new(None).registration(), registration)
            .unwrap();
        reply
    }

    /// Confirm the configuration sent to `reply`, returning the run id it carried
    fn confirm_by_hand(broker: &InMemoryBroker, reply: &Destination, id: &str) -> String {
        let config = broker.receive(reply, WAIT).unwrap().unwrap();
        let run = config.correlation_id.unwrap();
        let ready = Message::encode(&ReadyReport::Ready)
            .unwrap()
            .with_worker(id)
            .with_checksum(config.properties.config_checksum.unwrap())
            .with_correlation_id(run.as_str());
        broker
            .send(&QueueNames::new(None).ready(), ready)
            .unwrap();
        run
    }

    fn run_with_workers(
        run: RunConfiguration,
        config: DistributedConfig,
        workers: usize,
    ) -> (MasterReport, Vec<WorkerReport>) {
        let broker = InMemoryBroker::new();
        let handles: Vec<_> = (0..workers)
            .map(|i| spawn_worker(&broker, &format!("w{}", i)))
            .collect();
        let report = Master::new(broker, run, config).run().unwrap();
        let workers = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        (report, workers)
    }

    // ========================================================================
    // End-to-end
    // ========================================================================

    #[test]
    fn test_one_worker_synchronous() {
        let (report, workers) = run_with_workers(run_config(1), distributed(1), 1);

        assert_eq!(report.report.unsatisfied.len(), 2);
        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(report.report.job_count, 10);
        assert_eq!(report.locally_recovered, 0);
        assert_eq!(workers[0].processed, 1);
        assert!(report.workers[0].completed);
    }

    #[test]
    fn test_three_workers_synchronous() {
        let (report, workers) = run_with_workers(run_config(1), distributed(3), 3);

        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(report.workers.len(), 3);
        assert!(report.workers.iter().all(|w| w.completed && w.failure.is_none()));
        assert_eq!(workers.iter().map(|w| w.processed).sum::<usize>(), 3);
    }

    #[test]
    fn test_asynchronous_dispatch_with_several_batches() {
        let config = distributed(2).with_dispatch(DispatchMode::Asynchronous);
        let (report, workers) = run_with_workers(run_config(2), config, 2);

        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(workers.iter().map(|w| w.processed).sum::<usize>(), 4);
    }

    #[test]
    fn test_atom_dispatch() {
        let (report, workers) = run_with_workers(run_config(0), distributed(2), 2);

        assert_eq!(failing_ids(&report), vec![3, 7]);
        // The master keeps the first third, the workers get one atom per job
        let atoms: usize = report.workers.iter().map(|w| w.assigned).sum();
        assert_eq!(atoms, 10 - 3);
        assert_eq!(workers.iter().map(|w| w.processed).sum::<usize>(), atoms);
    }

    #[test]
    fn test_worker_execution_times_are_merged() {
        let (report, _) = run_with_workers(run_config(1), distributed(2), 2);
        assert!(report
            .report
            .execution_times
            .get("Person.NameNotEmpty")
            .is_some());
    }

    // ========================================================================
    // Failures
    // ========================================================================

    #[test]
    fn test_missing_worker_share_is_evaluated_locally() {
        let broker = InMemoryBroker::new();
        let worker = spawn_worker(&broker, "only");
        let config = distributed(2).with_registration_timeout(Duration::from_millis(300));

        let report = Master::new(broker, run_config(1), config).run().unwrap();
        worker.join().unwrap().unwrap();

        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(report.workers.len(), 1);
        assert!(report.locally_recovered > 0);
    }

    #[test]
    fn test_no_workers_at_all() {
        let broker = InMemoryBroker::new();
        let config = distributed(0);
        let report = Master::new(broker, run_config(1), config).run().unwrap();
        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(report.locally_recovered, 0);
    }

    #[test]
    fn test_surplus_registration_is_rejected() {
        let broker = InMemoryBroker::new();
        let handles = vec![spawn_worker(&broker, "a"), spawn_worker(&broker, "b")];
        let registration = QueueNames::new(None).registration();
        while broker.pending(&registration) < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        let report = Master::new(broker, run_config(1), distributed(1))
            .run()
            .unwrap();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Err(Error::Rejected(_))))
                .count(),
            1
        );
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    }

    #[test]
    fn test_late_joiner_is_accepted_when_enabled() {
        let broker = InMemoryBroker::new();
        let handles = vec![spawn_worker(&broker, "a"), spawn_worker(&broker, "b")];
        let registration = QueueNames::new(None).registration();
        while broker.pending(&registration) < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        let config = distributed(1).with_late_joiners(true);
        let report = Master::new(broker, run_config(1), config).run().unwrap();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(report.workers.len(), 2);
    }

    #[test]
    fn test_duplicate_worker_id_is_renamed() {
        let broker = InMemoryBroker::new();
        let handles = vec![spawn_worker(&broker, "same"), spawn_worker(&broker, "same")];
        let report = Master::new(broker, run_config(1), distributed(2))
            .run()
            .unwrap();
        let mut ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().worker_id)
            .collect();
        ids.sort();

        assert_eq!(ids, vec!["same".to_string(), "worker-1".to_string()]);
        assert_eq!(report.workers.len(), 2);
    }

    #[test]
    fn test_worker_configuration_failure_is_fatal() {
        let data = tempfile::tempdir().unwrap();
        let empty = tempfile::tempdir().unwrap();
        std::fs::write(data.path().join("script.ron"), SCRIPT).unwrap();
        std::fs::write(data.path().join("people.ron"), model()).unwrap();

        let run = RunConfiguration::new(
            Source::file("script.ron"),
            vec![ModelSource::new(Source::file("people.ron"))],
        )
        .with_base_path(data.path());

        let broker = InMemoryBroker::new();
        let worker = Worker::new(
            broker.clone(),
            WorkerConfig::new("lost")
                .with_base_path(empty.path())
                .with_config_timeout(WAIT),
        );
        let handle = thread::spawn(move || worker.run());

        let err = Master::new(broker, run, distributed(1)).run().unwrap_err();
        assert!(matches!(err, Error::WorkerConfiguration { ref worker, .. } if worker == "lost"));
        assert!(matches!(handle.join().unwrap(), Err(Error::Script(_))));
    }

    #[test]
    fn test_silent_worker_work_is_recovered() {
        // A fake worker that confirms and then never answers
        let broker = InMemoryBroker::new();
        let reply = register_by_hand(&broker, "mute");
        let fake = {
            let broker = broker.clone();
            thread::spawn(move || confirm_by_hand(&broker, &reply, "mute"))
        };

        let config = distributed(1).with_completion_timeout(Duration::from_millis(300));
        let report = Master::new(broker, run_config(1), config).run().unwrap();

        assert_eq!(fake.join().unwrap(), report.run_id);
        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert!(!report.workers[0].alive);
        assert_eq!(report.locally_recovered, 5);
    }

    #[test]
    fn test_completion_without_last_flag_is_not_counted() {
        let broker = InMemoryBroker::new();
        let reply = register_by_hand(&broker, "eager");
        let fake = {
            let broker = broker.clone();
            thread::spawn(move || {
                let run = confirm_by_hand(&broker, &reply, "eager");
                let names = QueueNames::new(None);
                broker.receive(&names.jobs("eager"), WAIT).unwrap().unwrap();
                let completion = ResultPayload::Completion {
                    execution_times: Profiler::new(),
                    failure: None,
                };
                let message = Message::encode(&completion)
                    .unwrap()
                    .with_worker("eager")
                    .with_correlation_id(run);
                broker.send(&names.results(), message).unwrap();
            })
        };

        let config = distributed(1).with_completion_timeout(Duration::from_millis(300));
        let report = Master::new(broker, run_config(1), config).run().unwrap();
        fake.join().unwrap();

        assert!(!report.workers[0].completed);
        assert!(!report.workers[0].alive);
        assert_eq!(report.locally_recovered, 5);
        assert_eq!(failing_ids(&report), vec![3, 7]);
    }

    // ========================================================================
    // Run isolation
    // ========================================================================

    fn stray_result(worker: &str, element: u64) -> Message {
        let failure = UnsatisfiedConstraint::new(
            verity_core::ConstraintKey::new("Person", "NameNotEmpty"),
            Some(verity_core::ElementRef::new("people", verity_core::ElementId(element))),
            "stray",
        );
        let payload = ResultPayload::Results {
            job: JobPayload::End,
            unsatisfied: vec![failure],
        };
        Message::encode(&payload).unwrap().with_worker(worker)
    }

    #[test]
    fn test_results_from_outside_the_run_are_ignored() {
        let broker = InMemoryBroker::new();
        let results = QueueNames::new(None).results();
        // An unregistered sender, and a registered id replaying an older run
        broker.send(&results, stray_result("ghost", 5)).unwrap();
        broker
            .send(&results, stray_result("w0", 8).with_correlation_id("previous-run"))
            .unwrap();

        let worker = spawn_worker(&broker, "w0");
        let report = Master::new(broker, run_config(1), distributed(1))
            .run()
            .unwrap();
        worker.join().unwrap().unwrap();

        assert_eq!(failing_ids(&report), vec![3, 7]);
        assert_eq!(report.report.unsatisfied.len(), 2);
    }

    #[test]
    fn test_back_to_back_runs_share_a_broker() {
        let broker = InMemoryBroker::new();
        let names = QueueNames::new(None);

        // The first run's worker goes silent, leaving its share queued
        let reply = register_by_hand(&broker, "w1");
        let fake = {
            let broker = broker.clone();
            thread::spawn(move || confirm_by_hand(&broker, &reply, "w1"))
        };
        let config = distributed(1).with_completion_timeout(Duration::from_millis(300));
        let first = Master::new(broker.clone(), run_config(1), config)
            .run()
            .unwrap();
        fake.join().unwrap();
        assert!(!first.workers[0].alive);
        for queue in [names.jobs("w1"), names.ready(), names.results()] {
            assert_eq!(broker.pending(&queue), 0, "{}", queue);
        }

        let worker = spawn_worker(&broker, "w1");
        let second = Master::new(broker, run_config(1), distributed(1))
            .run()
            .unwrap();
        let worker = worker.join().unwrap().unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(failing_ids(&second), vec![3, 7]);
        assert_eq!(second.locally_recovered, 0);
        assert_eq!(worker.processed, 1);
    }

    #[test]
    fn test_master_load_failure_publishes_stop() {
        let broker = InMemoryBroker::new();
        let stop = broker.subscribe("stop").unwrap();
        let run = RunConfiguration::new(
            Source::inline("broken.ron", "(contexts: ["),
            Vec::new(),
        );

        assert!(Master::new(broker.clone(), run, distributed(1)).run().is_err());
        assert!(broker.receive(&stop, Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn test_session_assigns_free_ids() {
        let mut registry = WorkerRegistry::new();
        registry.register("worker-1");
        let session = Session {
            run_id: "run-0",
            registry: &mut registry,
            plan: BatchPlan::new(0, 0, 1),
            jobs: Arc::new(Vec::new()),
            bytes: Vec::new(),
            checksum: 0,
            gathered: false,
            failed: Vec::new(),
            results: Vec::new(),
            times: Profiler::new(),
        };
        assert_eq!(session.assign_id(Some("fresh")), "fresh");
        assert_eq!(session.assign_id(Some("worker-1")), "worker-2");
        assert_eq!(session.assign_id(None), "worker-2");
    }
}
