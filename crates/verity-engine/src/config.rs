//! Engine Configuration - Parallelism, strategy and determinism settings
//!
//! [`EngineConfig`] controls how an [`ExecutionContext`](crate::ExecutionContext)
//! runs jobs: how many pool threads it starts, which
//! [`ExecutionStrategy`] distributes work, how thread-local results are merged
//! back, and the seed used to shuffle the canonical job list.
//!
//! Every process of a distributed run must use the same shuffle seed, or the
//! job indices that batches refer to would point at different jobs.

use crate::context::MergeMode;
use crate::strategy::ExecutionStrategy;
use serde::{Deserialize, Serialize};

/// Default seed for job shuffling and configuration checksums
pub const DEFAULT_GLOBAL_SEED: u64 = 0x5eed_cafe_f00d_beef;

/// Configuration for constraint execution
///
/// # Example
///
/// ```
/// use verity_engine::{EngineConfig, ExecutionStrategy};
///
/// // Sequential (default)
/// let config = EngineConfig::default();
/// assert_eq!(config.resolved_parallelism(), 1);
///
/// // Element-parallel on every available core
/// let config = EngineConfig::parallel(0);
/// assert_eq!(config.strategy(), ExecutionStrategy::ElementParallel);
/// assert_eq!(config.resolved_parallelism(), verity_engine::max_cores());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pool thread count; `0` means one thread per logical CPU
    ///
    /// Values above the hardware count are honoured as given.
    parallelism: usize,
    /// How jobs are distributed across threads
    strategy: ExecutionStrategy,
    /// How thread-local results fold into the shared set
    merge_mode: MergeMode,
    /// Drop lazy constraints nothing depends on
    optimize: bool,
    /// Seed for the job shuffle; `None` keeps the canonical order
    shuffle_seed: Option<u64>,
}

impl EngineConfig {
    /// Sequential configuration
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Element-parallel configuration with the given thread count
    ///
    /// `0` selects one thread per logical CPU.
    pub fn parallel(parallelism: usize) -> Self {
        Self {
            parallelism,
            strategy: ExecutionStrategy::ElementParallel,
            ..Self::default()
        }
    }

    /// Set the thread count (`0` = hardware)
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the execution strategy
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the merge mode
    pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
        self.merge_mode = merge_mode;
        self
    }

    /// Enable or disable dropping of unreferenced lazy constraints
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Shuffle the job list with the given seed
    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Keep jobs in canonical order
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle_seed = None;
        self
    }

    /// Configured thread count, `0` meaning hardware
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Set the thread count (`0` = hardware)
    pub fn set_parallelism(&mut self, parallelism: usize) {
        self.parallelism = parallelism;
    }

    /// Thread count the pool will actually use
    ///
    /// Sequential configurations always resolve to `1`.
    pub fn resolved_parallelism(&self) -> usize {
        if self.strategy == ExecutionStrategy::Sequential {
            1
        } else if self.parallelism == 0 {
            max_cores()
        } else {
            self.parallelism
        }
    }

    /// Execution strategy
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Merge mode
    pub fn merge_mode(&self) -> MergeMode {
        self.merge_mode
    }

    /// Whether unreferenced lazy constraints are dropped
    pub fn optimize(&self) -> bool {
        self.optimize
    }

    /// Shuffle seed, if any
    pub fn shuffle_seed(&self) -> Option<u64> {
        self.shuffle_seed
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            strategy: ExecutionStrategy::Sequential,
            merge_mode: MergeMode::Union,
            optimize: false,
            shuffle_seed: Some(DEFAULT_GLOBAL_SEED),
        }
    }
}

/// Get the maximum available cores on this system
///
/// This uses the `num_cpus` crate to detect the number of logical CPUs.
///
/// # Example
///
/// ```
/// let cores = verity_engine::max_cores();
/// assert!(cores >= 1);
/// ```
pub fn max_cores() -> usize {
    num_cpus::get()
}

/// Mix a seed with two words into a well-distributed 64-bit value
///
/// SplitMix64 finalizer over the combined inputs. Deterministic across runs
/// and platforms.
pub fn hash_seed(seed: u64, a: u64, b: u64) -> u64 {
    let mut z = seed
        .wrapping_add(a.wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(b.rotate_left(32).wrapping_mul(0xc2b2_ae3d_27d4_eb4f));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
