//! Worker bookkeeping on the master
//!
//! One [`WorkerRecord`] per registered worker, in registration order. A
//! record tracks the payloads sent to the worker and not yet answered, so
//! that work held by a worker that fails or goes silent can be recovered.

use crate::protocol::JobPayload;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use verity_engine::Profiler;

/// State of one worker as seen by the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub registered_at: DateTime<Utc>,
    /// Set once the worker reports that it is configured
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Last time any message arrived from this worker
    pub last_seen: DateTime<Utc>,
    /// False once the worker is given up on
    pub alive: bool,
    /// Whether its share of the work has been sent
    pub dispatched: bool,
    /// Payloads sent, `End` excluded
    pub assigned: usize,
    /// Payloads sent and not yet answered
    pub outstanding: Vec<JobPayload>,
    /// Execution times reported at completion
    pub execution_times: Profiler,
    /// Whether the completion message arrived
    pub completed: bool,
    /// Failure reported at completion, if any
    pub failure: Option<String>,
}

impl WorkerRecord {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            registered_at: now,
            confirmed_at: None,
            last_seen: now,
            alive: true,
            dispatched: false,
            assigned: 0,
            outstanding: Vec::new(),
            execution_times: Profiler::new(),
            completed: false,
            failure: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    /// Whether the master still waits on this worker
    pub fn is_pending(&self) -> bool {
        self.alive && self.dispatched && !self.completed
    }
}

/// Registered workers, keyed by worker id
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: IndexMap<String, WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration; returns false if the id is already known
    pub fn register(&mut self, id: &str) -> bool {
        if self.workers.contains_key(id) {
            return false;
        }
        self.workers
            .insert(id.to_string(), WorkerRecord::new(id.to_string()));
        true
    }

    /// Mark a worker as configured; returns false for unknown or already
    /// confirmed workers
    pub fn confirm(&mut self, id: &str) -> bool {
        match self.workers.get_mut(id) {
            Some(record) if !record.is_confirmed() => {
                let now = Utc::now();
                record.confirmed_at = Some(now);
                record.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Note that a message arrived from a worker
    pub fn touch(&mut self, id: &str) {
        if let Some(record) = self.workers.get_mut(id) {
            record.last_seen = Utc::now();
        }
    }

    /// Record payloads sent to a worker
    pub fn assign(&mut self, id: &str, payloads: &[JobPayload]) {
        if let Some(record) = self.workers.get_mut(id) {
            record.dispatched = true;
            for payload in payloads {
                if *payload != JobPayload::End {
                    record.assigned += 1;
                    record.outstanding.push(*payload);
                }
            }
        }
    }

    /// Record that a worker answered a payload
    pub fn acknowledge(&mut self, id: &str, payload: &JobPayload) {
        if let Some(record) = self.workers.get_mut(id) {
            record.last_seen = Utc::now();
            if let Some(pos) = record.outstanding.iter().position(|p| p == payload) {
                record.outstanding.remove(pos);
            }
        }
    }

    /// Record a worker's completion and return the payloads it never
    /// answered
    pub fn complete(
        &mut self,
        id: &str,
        execution_times: Profiler,
        failure: Option<String>,
    ) -> Vec<JobPayload> {
        match self.workers.get_mut(id) {
            Some(record) => {
                record.last_seen = Utc::now();
                record.completed = true;
                record.execution_times = execution_times;
                record.failure = failure;
                std::mem::take(&mut record.outstanding)
            }
            None => Vec::new(),
        }
    }

    /// Give up on a worker and return the payloads it still held
    pub fn mark_lost(&mut self, id: &str) -> Vec<JobPayload> {
        match self.workers.get_mut(id) {
            Some(record) => {
                record.alive = false;
                std::mem::take(&mut record.outstanding)
            }
            None => Vec::new(),
        }
    }

    /// Forget a worker that never received its configuration
    pub fn remove(&mut self, id: &str) -> Option<WorkerRecord> {
        self.workers.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&WorkerRecord> {
        self.workers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn confirmed_count(&self) -> usize {
        self.workers.values().filter(|r| r.is_confirmed()).count()
    }

    /// Workers the master is still waiting on
    pub fn pending(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values().filter(|r| r.is_pending())
    }

    /// Whether every dispatched worker has completed or been given up on
    pub fn all_finished(&self) -> bool {
        self.pending().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// Snapshot of every record in registration order
    pub fn records(&self) -> Vec<WorkerRecord> {
        self.workers.values().cloned().collect()
    }
}
