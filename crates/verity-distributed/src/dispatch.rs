//! Work partitioning for a distributed run
//!
//! The plan is computed once from the expected worker count, before any
//! worker is ready, so synchronous and asynchronous dispatch hand out the
//! same boundaries. Batch 0 always belongs to the master.

use crate::error::Result;
use crate::protocol::JobPayload;
use verity_engine::{split_into_batches, Batch, Job};

/// Batch boundaries and the cursor over unclaimed batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    batches: Vec<Batch>,
    per_worker: usize,
    atoms: bool,
    cursor: usize,
}

impl BatchPlan {
    /// Plan `job_count` jobs over the master and `workers` workers
    ///
    /// `batches_per_worker == 0` gives every worker one share sent as
    /// atoms; otherwise each worker receives that many batches.
    pub fn new(job_count: usize, workers: usize, batches_per_worker: usize) -> Self {
        let atoms = batches_per_worker == 0;
        let per_worker = batches_per_worker.max(1);
        let batches = split_into_batches(job_count, workers * per_worker + 1);
        Self {
            batches,
            per_worker,
            atoms,
            cursor: 1,
        }
    }

    /// Every batch of the plan
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn is_atomic(&self) -> bool {
        self.atoms
    }

    /// The batch the master evaluates itself
    pub fn master_share(&self) -> Option<Batch> {
        self.batches.first().copied()
    }

    /// Claim the next worker's batches; empty once everything is claimed
    pub fn next_share(&mut self) -> Vec<Batch> {
        let start = self.cursor.min(self.batches.len());
        let end = (start + self.per_worker).min(self.batches.len());
        self.cursor = end;
        self.batches[start..end].to_vec()
    }

    /// Claim every remaining batch
    pub fn unclaimed(&mut self) -> Vec<Batch> {
        let start = self.cursor.min(self.batches.len());
        self.cursor = self.batches.len();
        self.batches[start..].to_vec()
    }

    /// Number of batches not yet claimed
    pub fn remaining(&self) -> usize {
        self.batches.len().saturating_sub(self.cursor)
    }

    /// Turn claimed batches into payloads for the wire
    pub fn payloads(&self, share: &[Batch], jobs: &[Job]) -> Result<Vec<JobPayload>> {
        if !self.atoms {
            return Ok(share.iter().copied().map(JobPayload::Batch).collect());
        }
        let mut payloads = Vec::new();
        for batch in share {
            payloads.extend(batch.slice(jobs)?.iter().copied().map(JobPayload::Atom));
        }
        Ok(payloads)
    }
}
