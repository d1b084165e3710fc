use serde::{Deserialize, Serialize};

/// Stream manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Worker threads for generation tasks; 0 lets rayon pick.
    pub worker_threads: usize,
    /// When false, generation runs synchronously on the thread that loads a cell.
    pub async_generation: bool,
    /// Base seed every cell and child seed is derived from.
    pub seed: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            async_generation: true,
            seed: 0,
        }
    }
}

impl StreamConfig {
    /// Synchronous configuration, handy for deterministic tests and tools.
    pub fn synchronous(seed: u64) -> Self {
        Self {
            worker_threads: 0,
            async_generation: false,
            seed,
        }
    }
}
