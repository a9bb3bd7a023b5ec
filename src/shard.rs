//! Shard path assignment.
//!
//! A shard path is picked independently for every workload on every
//! cycle. The choice spreads load across downstream consumers; it is not
//! sticky, so a workload may move between shards from one cycle to the next.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

pub struct ShardSelector {
    paths: Vec<String>,
    rng: Box<dyn RngCore + Send>,
}

impl ShardSelector {
    pub fn new(paths: Vec<String>, rng: Box<dyn RngCore + Send>) -> Self {
        Self { paths, rng }
    }

    pub fn from_entropy(paths: Vec<String>) -> Self {
        Self::new(paths, Box::new(StdRng::from_entropy()))
    }

    #[cfg(test)]
    pub fn seeded(paths: Vec<String>, seed: u64) -> Self {
        Self::new(paths, Box::new(StdRng::seed_from_u64(seed)))
    }

    /// `None` when no candidates are configured.
    pub fn pick(&mut self) -> Option<String> {
        self.paths.choose(&mut self.rng).cloned()
    }
}
