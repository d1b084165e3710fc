use std::collections::VecDeque;
use std::time::Duration;

/// Stream manager counters for instrumentation.
///
/// Cumulative counters grow for the manager's lifetime; the snapshot fields
/// are refreshed on every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Payloads installed into cell slots.
    pub cells_loaded: u64,
    /// Cell slots removed at refcount zero.
    pub cells_evicted: u64,
    /// Generation tasks handed to the worker pool (cells and children).
    pub tasks_spawned: u64,
    /// Finished results thrown away because their slot was gone.
    pub tasks_discarded: u64,
    pub generation_failures: u64,
    pub total_cells: usize,
    pub complete_cells: usize,
    pub pending_cells: usize,
    pub total_children: usize,
    pub tick_time: Duration,
}

/// What one tick did, derived from consecutive [`StreamStats`] snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSample {
    pub tick_time: Duration,
    pub loaded: u64,
    pub evicted: u64,
    pub spawned: u64,
}

/// Rolling window over the last `capacity` ticks of a manager.
#[derive(Debug)]
pub struct TickHistory {
    samples: VecDeque<TickSample>,
    capacity: usize,
    last: Option<StreamStats>,
}

impl TickHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            last: None,
        }
    }

    /// Record the snapshot taken after a tick. The first snapshot only
    /// establishes a baseline for the cumulative counters.
    pub fn record(&mut self, stats: &StreamStats) {
        let base = self.last.replace(stats.clone()).unwrap_or_default();
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(TickSample {
            tick_time: stats.tick_time,
            loaded: stats.cells_loaded.saturating_sub(base.cells_loaded),
            evicted: stats.cells_evicted.saturating_sub(base.cells_evicted),
            spawned: stats.tasks_spawned.saturating_sub(base.tasks_spawned),
        });
    }

    pub fn samples(&self) -> impl Iterator<Item = &TickSample> {
        self.samples.iter()
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn average_tick(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().map(|s| s.tick_time).sum::<Duration>() / self.samples.len() as u32
    }

    pub fn slowest_tick(&self) -> Duration {
        self.samples.iter().map(|s| s.tick_time).max().unwrap_or_default()
    }

    /// Cells loaded plus cells evicted over the window.
    pub fn churn(&self) -> u64 {
        self.samples.iter().map(|s| s.loaded + s.evicted).sum()
    }

    /// Largest number of tasks spawned by a single tick in the window.
    pub fn peak_spawned(&self) -> u64 {
        self.samples.iter().map(|s| s.spawned).max().unwrap_or(0)
    }
}
