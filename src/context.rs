//! Explicit run context.
//!
//! Everything a run needs from the process (randomness, worker threads,
//! queue depth) travels in a [`RunContext`] instead of global state, so
//! concurrent sweep runs never share anything mutable.

use crate::config::RuntimeConfig;
use crate::error::Result;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

/// Compute resources and seed for one run.
#[derive(Clone)]
pub struct RunContext {
    seed: u64,
    workers: usize,
    prefetch: usize,
    pool: Arc<ThreadPool>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("seed", &self.seed)
            .field("workers", &self.workers)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

impl RunContext {
    /// Creates a context with its own worker pool.
    ///
    /// A missing seed is drawn from entropy once, so every consumer of the
    /// context still sees the same value.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let seed = match config.seed {
            Some(s) => s,
            None => {
                use rand::Rng;
                ChaCha8Rng::from_entropy().gen()
            }
        };
        Self::with_seed(seed, config.workers, config.prefetch)
    }

    /// Creates a context with an explicit seed.
    pub fn with_seed(seed: u64, workers: usize, prefetch: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("seisdec-loader-{}", i))
            .build()?;

        Ok(Self {
            seed,
            workers,
            prefetch: prefetch.max(1),
            pool: Arc::new(pool),
        })
    }

    /// Returns a copy of this context whose seed is offset by `salt`.
    ///
    /// Sweep runs derive their contexts this way so that sibling runs draw
    /// independent but reproducible random streams. The worker pool is shared.
    pub fn derive(&self, salt: u64) -> Self {
        Self {
            seed: self.seed.wrapping_add(salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            workers: self.workers,
            prefetch: self.prefetch,
            pool: Arc::clone(&self.pool),
        }
    }

    /// Base seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seeded generator for a named purpose.
    pub fn rng(&self, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        rng
    }

    /// Number of data loading workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Bounded queue depth between loader and compute loop.
    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Worker pool used by the data loader.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }
}
