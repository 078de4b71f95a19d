//! Wire protocol between master and workers
//!
//! ```text
//! worker                                   master
//!   │── registration (reply_to=temp) ──────▶│
//!   │◀──────── ConfigReply::Configuration ──│  (checksum property)
//!   │── ReadyReport::Ready ────────────────▶│  (checksum echoed)
//!   │◀──────────── JobPayload::Batch/Atom ──│  (one or more)
//!   │── ResultPayload::Results/Unprocessed ▶│  (one per payload)
//!   │◀──────────────────── JobPayload::End ─│
//!   │── ResultPayload::Completion ─────────▶│  (last_message)
//! ```
//!
//! Bodies are bincode-encoded. A batch carries only its index range; the
//! worker evaluates it against the job list it enumerated itself.

use crate::broker::Destination;
use serde::{Deserialize, Serialize};
use std::fmt;
use verity_core::UnsatisfiedConstraint;
use verity_engine::{Batch, Job, Profiler};

/// Reply to a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigReply {
    /// Encoded run configuration; the message carries its checksum
    Configuration(Vec<u8>),
    /// The master will not use this worker
    Rejected(String),
}

/// A worker's answer to its configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyReport {
    /// Configured and waiting for jobs
    Ready,
    /// Configuration failed; the run cannot continue
    Failed(String),
}

/// Work sent to a worker's job queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPayload {
    /// An index range of the canonical job list
    Batch(Batch),
    /// A single job sent in full
    Atom(Job),
    /// No more work follows
    End,
}

impl fmt::Display for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPayload::Batch(batch) => write!(f, "batch {}", batch),
            JobPayload::Atom(job) => write!(f, "atom {}", job),
            JobPayload::End => write!(f, "end"),
        }
    }
}

/// Messages on the results queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultPayload {
    /// A payload was evaluated
    Results {
        job: JobPayload,
        unsatisfied: Vec<UnsatisfiedConstraint>,
    },
    /// A payload could not be evaluated and must be redone by the master
    Unprocessed(JobPayload),
    /// The worker is done; sent with `last_message`
    Completion {
        execution_times: Profiler,
        failure: Option<String>,
    },
}

/// Well-known destination names, optionally scoped to a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNames {
    suffix: String,
}

impl QueueNames {
    /// Names for a session; `None` uses the bare names
    pub fn new(session: Option<&str>) -> Self {
        Self {
            suffix: session.map(|s| format!("-{}", s)).unwrap_or_default(),
        }
    }

    fn queue(&self, name: &str) -> Destination {
        Destination::Queue(format!("{}{}", name, self.suffix))
    }

    /// Where workers register
    pub fn registration(&self) -> Destination {
        self.queue("registration")
    }

    /// Where workers confirm their configuration
    pub fn ready(&self) -> Destination {
        self.queue("confirm-configured")
    }

    /// Where workers send results
    pub fn results(&self) -> Destination {
        self.queue("results")
    }

    /// A worker's private job queue
    pub fn jobs(&self, worker: &str) -> Destination {
        self.queue(&format!("{}-jobs", worker))
    }

    /// Name of the stop topic
    pub fn stop_topic(&self) -> String {
        format!("stop{}", self.suffix)
    }

    /// The stop topic as a destination
    pub fn stop(&self) -> Destination {
        Destination::Topic(self.stop_topic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Message;
    use verity_core::{ConstraintKey, ElementId, ElementRef};

    #[test]
    fn test_queue_names() {
        let names = QueueNames::new(None);
        assert_eq!(names.registration(), Destination::Queue("registration".into()));
        assert_eq!(names.jobs("w1"), Destination::Queue("w1-jobs".into()));
        assert_eq!(names.stop(), Destination::Topic("stop".into()));

        let scoped = QueueNames::new(Some("run7"));
        assert_eq!(scoped.ready(), Destination::Queue("confirm-configured-run7".into()));
        assert_eq!(scoped.results(), Destination::Queue("results-run7".into()));
        assert_eq!(scoped.jobs("w1"), Destination::Queue("w1-jobs-run7".into()));
        assert_eq!(scoped.stop_topic(), "stop-run7");
    }

    #[test]
    fn test_result_payload_survives_the_wire() {
        let payload = ResultPayload::Results {
            job: JobPayload::Batch(Batch::new(3, 9)),
            unsatisfied: vec![UnsatisfiedConstraint::new(
                ConstraintKey::new("Person", "NameNotEmpty"),
                Some(ElementRef::new("people", ElementId(4))),
                "empty",
            )],
        };
        let decoded: ResultPayload = Message::encode(&payload).unwrap().decode().unwrap();
        assert_eq!(decoded, payload);
    }
}
