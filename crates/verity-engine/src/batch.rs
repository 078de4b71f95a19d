//! Batches: contiguous index ranges over the job list
//!
//! Batches carry only indices. A worker that enumerated the same job list
//! can evaluate a batch without ever receiving the jobs themselves.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// A half-open range `[from, to)` of job indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Batch {
    pub from: usize,
    pub to: usize,
}

impl Batch {
    /// Create a new batch
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// Number of jobs covered
    pub fn len(&self) -> usize {
        self.to.saturating_sub(self.from)
    }

    /// Whether the batch covers no jobs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index range
    pub fn range(&self) -> Range<usize> {
        self.from..self.to
    }

    /// Borrow the covered slice of a job list
    pub fn slice<'a, T>(&self, items: &'a [T]) -> Result<&'a [T]> {
        items.get(self.range()).ok_or(Error::BatchOutOfRange {
            from: self.from,
            to: self.to,
            len: items.len(),
        })
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Split `total` jobs into `count` batches
///
/// - `count < 2`: one batch covering everything
/// - `count >= total`: one singleton batch per job
/// - otherwise: `count` chunks of `total / count`, the last one taking the
///   remainder
///
/// Master and workers must agree on this exactly.
pub fn split_into_batches(total: usize, count: usize) -> Vec<Batch> {
    if count < 2 {
        return vec![Batch::new(0, total)];
    }
    if count >= total {
        return (0..total).map(|i| Batch::new(i, i + 1)).collect();
    }
    let size = total / count;
    (0..count)
        .map(|i| {
            let from = i * size;
            let to = if i == count - 1 { total } else { from + size };
            Batch::new(from, to)
        })
        .collect()
}
