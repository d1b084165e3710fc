//! The stream manager: ticket reconciliation, slot lifecycle and queries.
//!
//! A single driver thread owns the manager. Each reconcile pass diffs every
//! ticket against the target it applied last time, folds the results into a
//! per-coordinate net delta, applies all additions before any removals, then
//! installs finished generation results and sweeps idle slots.
//!
//! # Invariants
//! - After tickets are applied, a cell's refcount equals the number of live
//!   cell tickets covering it plus the live child tickets targeting one of
//!   its elements.
//! - At most one generation task exists per cell or child, including tasks
//!   parked after their slot was evicted.
//! - A result is only installed through the live slot that owns its task.
//! - Child slots never hold references on their parent cell.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use cosmos_common::{CellCoord, TicketId};
use cosmos_octree::Element;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::payload::{CellGenerator, ChildGenerator, ChildId, Nested, NoChildren, Payload};
use crate::roi::RegionOfInterest;
use crate::slot::{Polled, Slot};
use crate::stats::StreamStats;
use crate::task::{GenerationTask, WorkerPool};
use crate::ticket::{ChildTicket, ManagerId, Ticket, TicketScope, Tracker};

type CellSlot<I> = Slot<CellCoord, Payload<I>>;
type ChildSlot<F> = Slot<ChildId, F>;

/// Ticketed, refcounted cache of generated cells and their expanded children.
pub struct StreamManager<G, C = NoChildren>
where
    G: CellGenerator,
    C: ChildGenerator<G::Info>,
{
    id: ManagerId,
    config: StreamConfig,
    pool: WorkerPool,
    generator: Arc<G>,
    child_generator: Arc<C>,
    cells: HashMap<CellCoord, CellSlot<G::Info>>,
    children: HashMap<ChildId, ChildSlot<C::Full>>,
    trackers: HashMap<TicketId, Tracker<RegionOfInterest>>,
    child_trackers: HashMap<TicketId, Tracker<Option<ChildId>>>,
    /// Child slots waiting for their parent payload.
    waiting: BTreeSet<ChildId>,
    orphan_cells: HashMap<CellCoord, GenerationTask<Payload<G::Info>>>,
    orphan_children: HashMap<ChildId, GenerationTask<C::Full>>,
    stats: StreamStats,
}

impl<G: CellGenerator> StreamManager<G> {
    /// Manager without child expansion, with its own worker pool.
    pub fn new(config: StreamConfig, generator: G) -> Result<Self, StreamError> {
        let pool = WorkerPool::new(&config)?;
        Ok(Self::with_pool(config, pool, generator, NoChildren))
    }
}

impl<G, C> StreamManager<G, C>
where
    G: CellGenerator,
    C: ChildGenerator<G::Info>,
{
    pub fn with_children(
        config: StreamConfig,
        generator: G,
        child_generator: C,
    ) -> Result<Self, StreamError> {
        let pool = WorkerPool::new(&config)?;
        Ok(Self::with_pool(config, pool, generator, child_generator))
    }

    /// Manager running its tasks on an existing pool.
    pub fn with_pool(
        config: StreamConfig,
        pool: WorkerPool,
        generator: G,
        child_generator: C,
    ) -> Self {
        let id = ManagerId::next();
        tracing::debug!(manager = id.0, async_generation = pool.is_async(), "stream manager created");
        Self {
            id,
            config,
            pool,
            generator: Arc::new(generator),
            child_generator: Arc::new(child_generator),
            cells: HashMap::new(),
            children: HashMap::new(),
            trackers: HashMap::new(),
            child_trackers: HashMap::new(),
            waiting: BTreeSet::new(),
            orphan_cells: HashMap::new(),
            orphan_children: HashMap::new(),
            stats: StreamStats::default(),
        }
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    // --- tickets ---

    /// Create a ticket owned by `scope` and apply it right away.
    pub fn create_ticket(&mut self, scope: &mut TicketScope, roi: RegionOfInterest) -> Ticket {
        let ticket = self.create_ticket_manual(roi);
        scope.adopt(ticket.shared.clone());
        ticket
    }

    /// Create a ticket the caller disposes explicitly.
    pub fn create_ticket_manual(&mut self, roi: RegionOfInterest) -> Ticket {
        let ticket = Ticket::new(self.id, roi);
        tracing::debug!(ticket = ?ticket.id(), ?roi, "ticket created");
        self.trackers
            .insert(ticket.shared.id(), Tracker::new(Arc::clone(&ticket.shared)));
        self.apply_tickets();
        ticket
    }

    pub fn dispose_ticket(&mut self, ticket: &Ticket) {
        self.check_ticket(ticket.manager(), ticket.id(), ticket.is_disposed());
        ticket.dispose();
        self.apply_tickets();
    }

    pub fn create_child_ticket(
        &mut self,
        scope: &mut TicketScope,
        target: Option<ChildId>,
    ) -> ChildTicket {
        let ticket = self.create_child_ticket_manual(target);
        scope.adopt(ticket.shared.clone());
        ticket
    }

    pub fn create_child_ticket_manual(&mut self, target: Option<ChildId>) -> ChildTicket {
        let ticket = ChildTicket::new(self.id, target);
        tracing::debug!(ticket = ?ticket.id(), ?target, "child ticket created");
        self.child_trackers
            .insert(ticket.shared.id(), Tracker::new(Arc::clone(&ticket.shared)));
        self.apply_tickets();
        ticket
    }

    pub fn dispose_child_ticket(&mut self, ticket: &ChildTicket) {
        self.check_ticket(ticket.manager(), ticket.id(), ticket.is_disposed());
        ticket.dispose();
        self.apply_tickets();
    }

    /// Number of live (not disposed) tickets of either kind.
    pub fn live_references(&self) -> usize {
        self.trackers.values().filter(|t| !t.is_disposed()).count()
            + self.child_trackers.values().filter(|t| !t.is_disposed()).count()
    }

    fn check_ticket(&self, manager: ManagerId, id: TicketId, disposed: bool) {
        assert_eq!(manager, self.id, "ticket {id:?} belongs to another manager");
        assert!(!disposed, "ticket {id:?} used after dispose");
    }

    // --- reconciliation ---

    /// Per-tick pass: apply ticket changes, install finished work, sweep idle
    /// slots.
    pub fn reconcile(&mut self) {
        let _span = tracing::debug_span!("reconcile", manager = self.id.0).entered();
        self.apply_tickets();
        self.drain_finished();
        if self.start_waiting_children() {
            self.drain_finished();
        }
        self.sweep();
        self.refresh_stats();
    }

    /// Reconcile, then tick every expanded child.
    pub fn tick(&mut self) {
        let start = Instant::now();
        self.reconcile();
        for slot in self.children.values() {
            if let Some(full) = slot.get() {
                full.tick();
            }
        }
        self.stats.tick_time = start.elapsed();
        tracing::trace!(
            cells = self.stats.total_cells,
            complete = self.stats.complete_cells,
            pending = self.stats.pending_cells,
            children = self.stats.total_children,
            "stream tick complete"
        );
    }

    fn apply_tickets(&mut self) {
        let mut cell_delta: BTreeMap<CellCoord, i32> = BTreeMap::new();
        let mut child_delta: BTreeMap<ChildId, i32> = BTreeMap::new();

        self.trackers.retain(|_, tracker| {
            if tracker.is_disposed() {
                if let Some(roi) = tracker.applied.take() {
                    roi.for_each_affected_cell(|c| bump(&mut cell_delta, c, -1));
                }
                return false;
            }
            match tracker.advance() {
                None => {}
                Some((None, roi)) => roi.for_each_affected_cell(|c| bump(&mut cell_delta, c, 1)),
                Some((Some(previous), roi)) => {
                    let diff = roi.diff(&previous);
                    for c in diff.added {
                        bump(&mut cell_delta, c, 1);
                    }
                    for c in diff.removed {
                        bump(&mut cell_delta, c, -1);
                    }
                }
            }
            true
        });

        self.child_trackers.retain(|_, tracker| {
            let disposed = tracker.is_disposed();
            let (previous, current) = if disposed {
                (tracker.applied.take().flatten(), None)
            } else {
                match tracker.advance() {
                    None => return true,
                    Some((previous, current)) => (previous.flatten(), current),
                }
            };
            // a child ticket also holds its parent cell
            if let Some(id) = previous {
                bump(&mut child_delta, id, -1);
                bump(&mut cell_delta, id.cell, -1);
            }
            if let Some(id) = current {
                bump(&mut child_delta, id, 1);
                bump(&mut cell_delta, id.cell, 1);
            }
            !disposed
        });

        cell_delta.retain(|_, d| *d != 0);
        child_delta.retain(|_, d| *d != 0);
        if cell_delta.is_empty() && child_delta.is_empty() {
            return;
        }
        let _span = tracing::debug_span!(
            "apply_tickets",
            cells = cell_delta.len(),
            children = child_delta.len()
        )
        .entered();

        for (&id, &d) in child_delta.iter().filter(|(_, d)| **d > 0) {
            for _ in 0..d {
                self.load_child(id);
            }
        }
        for (&id, &d) in child_delta.iter().filter(|(_, d)| **d < 0) {
            for _ in 0..-d {
                self.unload_child(id);
            }
        }
        for (&coord, &d) in cell_delta.iter().filter(|(_, d)| **d > 0) {
            for _ in 0..d {
                self.load_cell(coord);
            }
        }
        for (&coord, &d) in cell_delta.iter().filter(|(_, d)| **d < 0) {
            for _ in 0..-d {
                self.unload_cell(coord);
            }
        }
    }

    fn load_cell(&mut self, coord: CellCoord) {
        let slot = self.cells.entry(coord).or_insert_with(|| Slot::new(coord));
        if slot.acquire() {
            let task = self.cell_task(coord);
            if let Some(slot) = self.cells.get_mut(&coord) {
                slot.start(task);
            }
        }
    }

    fn cell_task(&mut self, coord: CellCoord) -> GenerationTask<Payload<G::Info>> {
        if let Some(task) = self.orphan_cells.remove(&coord) {
            tracing::debug!(%coord, "adopting in-flight cell generation");
            return task;
        }
        tracing::debug!(%coord, "scheduling cell generation");
        self.stats.tasks_spawned += 1;
        let generator = Arc::clone(&self.generator);
        let seed = coord.seed(self.config.seed);
        self.pool.spawn(move || generator.generate(coord, seed))
    }

    fn unload_cell(&mut self, coord: CellCoord) {
        let Some(slot) = self.cells.get_mut(&coord) else {
            tracing::warn!(%coord, "unload of a cell without a slot");
            return;
        };
        if slot.release() == 0 {
            self.evict_cell(coord);
        }
    }

    fn evict_cell(&mut self, coord: CellCoord) {
        let Some(mut slot) = self.cells.remove(&coord) else {
            return;
        };
        if let Some(task) = slot.take_task() {
            if task.cancel() {
                tracing::trace!(%coord, "cancelled queued cell generation");
            } else {
                self.orphan_cells.insert(coord, task);
            }
        }
        self.stats.cells_evicted += 1;
        tracing::debug!(%coord, "cell evicted");
    }

    fn load_child(&mut self, id: ChildId) {
        let slot = self.children.entry(id).or_insert_with(|| Slot::new(id));
        if slot.acquire() {
            self.start_child(id);
        }
    }

    /// Start an `Empty` child slot, or park it until its parent completes.
    fn start_child(&mut self, id: ChildId) {
        let task = match self.orphan_children.remove(&id) {
            Some(task) => {
                tracing::debug!(%id, "adopting in-flight child generation");
                task
            }
            None => {
                let Some(parent) = self.cells.get(&id.cell).and_then(|s| s.get()).cloned() else {
                    self.waiting.insert(id);
                    return;
                };
                if parent.get(id.element).is_none() {
                    tracing::warn!(%id, "child element does not exist in its cell");
                    self.waiting.remove(&id);
                    return;
                }
                tracing::debug!(%id, "scheduling child generation");
                self.stats.tasks_spawned += 1;
                let generator = Arc::clone(&self.child_generator);
                let seed = id.seed(self.config.seed);
                self.pool
                    .spawn(move || generator.generate(&parent, id.element, seed))
            }
        };
        self.waiting.remove(&id);
        if let Some(slot) = self.children.get_mut(&id) {
            slot.start(task);
        }
    }

    fn unload_child(&mut self, id: ChildId) {
        let Some(slot) = self.children.get_mut(&id) else {
            tracing::warn!(%id, "unload of a child without a slot");
            return;
        };
        if slot.release() == 0 && !holds_nested(slot) {
            self.evict_child(id);
        }
    }

    fn evict_child(&mut self, id: ChildId) {
        self.waiting.remove(&id);
        let Some(mut slot) = self.children.remove(&id) else {
            return;
        };
        if let Some(task) = slot.take_task() {
            if !task.cancel() {
                self.orphan_children.insert(id, task);
            }
        }
        tracing::debug!(%id, "child evicted");
    }

    fn drain_finished(&mut self) {
        for (coord, slot) in self.cells.iter_mut() {
            match slot.poll() {
                Polled::Idle => {}
                Polled::Installed => {
                    self.stats.cells_loaded += 1;
                    tracing::trace!(%coord, "cell payload installed");
                }
                Polled::Failed(err) => {
                    self.stats.generation_failures += 1;
                    tracing::warn!(%coord, %err, "cell generation failed");
                }
            }
        }
        for (id, slot) in self.children.iter_mut() {
            match slot.poll() {
                Polled::Idle => {}
                Polled::Installed => tracing::trace!(%id, "child installed"),
                Polled::Failed(err) => {
                    self.stats.generation_failures += 1;
                    tracing::warn!(%id, %err, "child generation failed");
                }
            }
        }
        let discarded =
            discard_finished(&mut self.orphan_cells) + discard_finished(&mut self.orphan_children);
        self.stats.tasks_discarded += discarded as u64;
    }

    /// Returns true if any child was started.
    fn start_waiting_children(&mut self) -> bool {
        let ready: Vec<ChildId> = self
            .waiting
            .iter()
            .filter(|id| self.cells.get(&id.cell).is_some_and(|s| s.is_complete()))
            .copied()
            .collect();
        let mut started = false;
        for id in ready {
            self.waiting.remove(&id);
            if self
                .children
                .get(&id)
                .is_some_and(|s| s.is_empty() && s.refcount() > 0)
            {
                self.start_child(id);
                started = true;
            }
        }
        started
    }

    fn sweep(&mut self) {
        let idle_children: Vec<ChildId> = self
            .children
            .iter()
            .filter(|(_, s)| s.refcount() == 0 && !holds_nested(s))
            .map(|(id, _)| *id)
            .collect();
        for id in idle_children {
            self.evict_child(id);
        }
        let idle_cells: Vec<CellCoord> = self
            .cells
            .iter()
            .filter(|(_, s)| s.refcount() == 0)
            .map(|(coord, _)| *coord)
            .collect();
        for coord in idle_cells {
            self.evict_cell(coord);
        }
    }

    fn refresh_stats(&mut self) {
        self.stats.total_cells = self.cells.len();
        self.stats.complete_cells = self.cells.values().filter(|s| s.is_complete()).count();
        self.stats.pending_cells = self.cells.values().filter(|s| s.is_pending()).count();
        self.stats.total_children = self.children.len();
    }

    // --- blocking loads ---

    /// Block until every cell the ticket covers is generated.
    pub fn force_load(
        &mut self,
        ticket: &Ticket,
    ) -> Result<BTreeMap<CellCoord, Arc<Payload<G::Info>>>, StreamError> {
        let roi = self.applied_roi(ticket);
        let _span = tracing::debug_span!("force_load", cells = roi.cell_count()).entered();
        let mut loaded = BTreeMap::new();
        for coord in roi.affected_cells() {
            loaded.insert(coord, self.block_on_cell(coord)?);
        }
        Ok(loaded)
    }

    /// Block until one covered cell is generated.
    pub fn force_load_cell(
        &mut self,
        ticket: &Ticket,
        coord: CellCoord,
    ) -> Result<Arc<Payload<G::Info>>, StreamError> {
        let roi = self.applied_roi(ticket);
        assert!(
            roi.covers(coord),
            "cell {coord} is not covered by ticket {:?}",
            ticket.id()
        );
        self.block_on_cell(coord)
    }

    /// Block until the ticket's child (and its parent cell) is generated.
    pub fn force_load_child(&mut self, ticket: &ChildTicket) -> Result<Arc<C::Full>, StreamError> {
        self.check_ticket(ticket.manager(), ticket.id(), ticket.is_disposed());
        self.apply_tickets();
        let Some(id) = self
            .child_trackers
            .get(&ticket.id())
            .and_then(|t| t.applied)
            .flatten()
        else {
            panic!("child ticket {:?} has no target", ticket.id());
        };

        let parent = self.block_on_cell(id.cell)?;
        if parent.get(id.element).is_none() {
            return Err(StreamError::NoSuchElement(id));
        }
        if self.children.get(&id).is_some_and(|s| s.is_empty()) {
            self.start_child(id);
        }
        let _span = tracing::debug_span!("force_load_child", %id).entered();
        let slot = self
            .children
            .get_mut(&id)
            .unwrap_or_else(|| panic!("child {id} has no live references"));
        match slot.wait() {
            Ok((full, _)) => Ok(full),
            Err(source) => {
                self.stats.generation_failures += 1;
                tracing::warn!(%id, %source, "child generation failed");
                Err(StreamError::ChildGeneration { id, source })
            }
        }
    }

    fn applied_roi(&mut self, ticket: &Ticket) -> RegionOfInterest {
        self.check_ticket(ticket.manager(), ticket.id(), ticket.is_disposed());
        self.apply_tickets();
        self.trackers
            .get(&ticket.id())
            .and_then(|t| t.applied)
            .unwrap_or_else(|| panic!("ticket {:?} is not tracked", ticket.id()))
    }

    fn block_on_cell(&mut self, coord: CellCoord) -> Result<Arc<Payload<G::Info>>, StreamError> {
        if self.cells.get(&coord).is_some_and(|s| s.is_empty()) {
            let task = self.cell_task(coord);
            if let Some(slot) = self.cells.get_mut(&coord) {
                slot.start(task);
            }
        }
        let slot = self
            .cells
            .get_mut(&coord)
            .unwrap_or_else(|| panic!("cell {coord} has no live references"));
        match slot.wait() {
            Ok((payload, installed)) => {
                if installed {
                    self.stats.cells_loaded += 1;
                }
                Ok(payload)
            }
            Err(source) => {
                self.stats.generation_failures += 1;
                tracing::warn!(%coord, %source, "cell generation failed");
                Err(StreamError::Generation { coord, source })
            }
        }
    }

    // --- non-blocking queries ---

    pub fn get_completed(&self, coord: CellCoord) -> Option<Arc<Payload<G::Info>>> {
        self.cells.get(&coord)?.get().cloned()
    }

    pub fn get_child(&self, id: ChildId) -> Option<Arc<C::Full>> {
        self.children.get(&id)?.get().cloned()
    }

    /// Info of one element of a completed cell.
    pub fn element(&self, id: ChildId) -> Option<Element<'_, G::Info>> {
        self.cells.get(&id.cell)?.get()?.element(id.element)
    }

    /// Visit every completed cell covered by the ticket's last applied region.
    pub fn enumerate(
        &self,
        ticket: &Ticket,
        mut visitor: impl FnMut(CellCoord, &Arc<Payload<G::Info>>),
    ) {
        self.check_ticket(ticket.manager(), ticket.id(), ticket.is_disposed());
        let Some(roi) = self.trackers.get(&ticket.id()).and_then(|t| t.applied) else {
            return;
        };
        roi.for_each_affected_cell(|coord| {
            if let Some(payload) = self.cells.get(&coord).and_then(|s| s.get()) {
                visitor(coord, payload);
            }
        });
    }

    /// True while the cell is referenced, whatever its generation state.
    pub fn is_loaded(&self, coord: CellCoord) -> bool {
        self.cells.get(&coord).is_some_and(|s| s.refcount() > 0)
    }

    pub fn is_complete(&self, coord: CellCoord) -> bool {
        self.cells.get(&coord).is_some_and(|s| s.is_complete())
    }

    /// True once every cell of the ticket's applied region is complete.
    pub fn is_ticket_complete(&self, ticket: &Ticket) -> bool {
        let Some(roi) = self.trackers.get(&ticket.id()).and_then(|t| t.applied) else {
            return false;
        };
        let mut complete = true;
        roi.for_each_affected_cell(|coord| complete &= self.is_complete(coord));
        complete
    }

    pub fn refcount(&self, coord: CellCoord) -> u32 {
        self.cells.get(&coord).map_or(0, |s| s.refcount())
    }

    pub fn child_refcount(&self, id: ChildId) -> u32 {
        self.children.get(&id).map_or(0, |s| s.refcount())
    }

    /// Coordinates that currently have a slot.
    pub fn loaded_cells(&self) -> impl Iterator<Item = CellCoord> + '_ {
        self.cells.keys().copied()
    }

    /// Completed children and their values.
    pub fn completed_children(&self) -> impl Iterator<Item = (ChildId, &Arc<C::Full>)> + '_ {
        self.children
            .iter()
            .filter_map(|(id, slot)| slot.get().map(|full| (*id, full)))
    }
}

impl<G, C> std::fmt::Debug for StreamManager<G, C>
where
    G: CellGenerator,
    C: ChildGenerator<G::Info>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("id", &self.id)
            .field("cells", &self.cells.len())
            .field("children", &self.children.len())
            .field("tickets", &(self.trackers.len() + self.child_trackers.len()))
            .field("async", &self.pool.is_async())
            .finish()
    }
}

fn bump<K: Ord>(delta: &mut BTreeMap<K, i32>, key: K, by: i32) {
    *delta.entry(key).or_default() += by;
}

fn holds_nested<F: Nested>(slot: &ChildSlot<F>) -> bool {
    slot.get().is_some_and(|full| full.nested_references() > 0)
}

/// Drop orphaned tasks that have reported. Returns how many were dropped.
fn discard_finished<K: std::fmt::Debug, T>(orphans: &mut HashMap<K, GenerationTask<T>>) -> usize {
    let before = orphans.len();
    orphans.retain(|key, task| {
        let finished = task.try_take().is_some();
        if finished {
            tracing::trace!(?key, "discarding stale generation result");
        }
        !finished
    });
    before - orphans.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use cosmos_common::content_rng;
    use cosmos_octree::{ElementId, OctreeConfig};
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use glam::DVec3;
    use rand::Rng;

    use crate::error::GenerationError;

    /// Three elements per cell, each tagged with the generation number.
    #[derive(Clone, Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Counting {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CellGenerator for Counting {
        type Info = usize;

        fn generate(&self, coord: CellCoord, _seed: u64) -> Result<Payload<usize>, GenerationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::build(
                coord,
                OctreeConfig::default(),
                (0..3).map(|i| (coord.center() + DVec3::splat(i as f64 * 0.1 - 0.1), n)),
            ))
        }
    }

    /// Fails the first `failures` attempts.
    struct Flaky {
        failures: AtomicUsize,
    }

    impl CellGenerator for Flaky {
        type Info = ();

        fn generate(&self, coord: CellCoord, _seed: u64) -> Result<Payload<()>, GenerationError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(GenerationError::failed("flaky"));
            }
            Ok(Payload::empty(coord))
        }
    }

    struct Exploding;

    impl CellGenerator for Exploding {
        type Info = ();

        fn generate(&self, _: CellCoord, _: u64) -> Result<Payload<()>, GenerationError> {
            panic!("generator blew up")
        }
    }

    /// Blocks each generation until a release token arrives.
    #[derive(Clone)]
    struct Gated {
        started: Sender<CellCoord>,
        release: Receiver<()>,
        calls: Arc<AtomicUsize>,
    }

    impl CellGenerator for Gated {
        type Info = ();

        fn generate(&self, coord: CellCoord, _: u64) -> Result<Payload<()>, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(coord);
            let _ = self.release.recv();
            Ok(Payload::empty(coord))
        }
    }

    struct Expanded {
        generation: usize,
        nested: Arc<AtomicUsize>,
        ticks: AtomicUsize,
    }

    impl Nested for Expanded {
        fn nested_references(&self) -> usize {
            self.nested.load(Ordering::SeqCst)
        }

        fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct Expand {
        calls: Arc<AtomicUsize>,
        nested: Arc<AtomicUsize>,
    }

    impl ChildGenerator<usize> for Expand {
        type Full = Expanded;

        fn generate(
            &self,
            parent: &Payload<usize>,
            element: ElementId,
            _seed: u64,
        ) -> Result<Expanded, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let generation = *parent
                .get(element)
                .ok_or_else(|| GenerationError::failed("missing element"))?;
            Ok(Expanded {
                generation,
                nested: Arc::clone(&self.nested),
                ticks: AtomicUsize::new(0),
            })
        }
    }

    fn sync_manager() -> (StreamManager<Counting>, Counting) {
        let generator = Counting::default();
        let manager = StreamManager::new(StreamConfig::synchronous(1), generator.clone()).unwrap();
        (manager, generator)
    }

    fn child_manager() -> (StreamManager<Counting, Expand>, Expand) {
        let children = Expand::default();
        let manager = StreamManager::with_children(
            StreamConfig::synchronous(1),
            Counting::default(),
            children.clone(),
        )
        .unwrap();
        (manager, children)
    }

    fn one_worker() -> StreamConfig {
        StreamConfig {
            worker_threads: 1,
            async_generation: true,
            seed: 0,
        }
    }

    fn gated() -> (Gated, Receiver<CellCoord>, Sender<()>) {
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let generator = Gated {
            started: started_tx,
            release: release_rx,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        (generator, started_rx, release_tx)
    }

    fn reconcile_until<G, C>(
        manager: &mut StreamManager<G, C>,
        mut done: impl FnMut(&StreamManager<G, C>) -> bool,
    ) -> bool
    where
        G: CellGenerator,
        C: ChildGenerator<G::Info>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            manager.reconcile();
            if done(manager) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn single(x: i32, y: i32, z: i32) -> RegionOfInterest {
        RegionOfInterest::single(CellCoord::new(x, y, z))
    }

    #[test]
    fn single_ticket_load_and_dispose() {
        let (mut m, _) = sync_manager();
        let origin = CellCoord::new(0, 0, 0);
        let ticket = m.create_ticket_manual(RegionOfInterest::single(origin));

        let loaded = m.force_load(&ticket).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&origin].coord(), origin);
        assert!(m.get_completed(origin).is_some());

        m.dispose_ticket(&ticket);
        m.reconcile();
        assert!(m.get_completed(origin).is_none());
        assert_eq!(m.refcount(origin), 0);
    }

    #[test]
    fn multi_ticket_covers_27_cells_and_small_moves_are_free() {
        let (mut m, generator) = sync_manager();
        let ticket = m.create_ticket_manual(RegionOfInterest::multi(DVec3::ZERO, 1.4));
        m.reconcile();
        assert_eq!(m.loaded_cells().count(), 27);
        assert_eq!(generator.calls(), 27);
        assert!(m.is_ticket_complete(&ticket));

        ticket.update(|roi| {
            if let RegionOfInterest::Multi { center, .. } = roi {
                *center += DVec3::new(0.01, 0.0, 0.0);
            }
        });
        m.reconcile();
        assert_eq!(generator.calls(), 27);
        assert_eq!(m.stats().tasks_spawned, 27);
        assert!(m.loaded_cells().all(|c| m.refcount(c) == 1));
    }

    #[test]
    fn lod_ticket_keeps_coarse_levels_resident() {
        let (mut m, generator) = sync_manager();
        let ticket = m.create_ticket_manual(RegionOfInterest::lod(DVec3::ZERO, 1.4, 2));
        m.reconcile();
        assert_eq!(m.loaded_cells().count(), 81);
        assert_eq!(generator.calls(), 81);
        assert!(m.is_complete(CellCoord::at_level(2, 1, 1, 1)));
        assert!(m.is_ticket_complete(&ticket));

        ticket.update(|roi| {
            if let RegionOfInterest::Multi { max_level, .. } = roi {
                *max_level = 1;
            }
        });
        m.reconcile();
        assert_eq!(m.loaded_cells().count(), 54);
        assert!(m.loaded_cells().all(|c| c.level <= 1));
        assert_eq!(generator.calls(), 81);

        m.dispose_ticket(&ticket);
        m.reconcile();
        assert_eq!(m.loaded_cells().count(), 0);
    }

    #[test]
    fn refcounts_match_live_tickets_under_motion() {
        let (mut m, _) = sync_manager();
        let mut rng = content_rng(77);
        let mut tickets: Vec<Ticket> = Vec::new();

        for step in 0..60 {
            match rng.random_range(0..=3) {
                0 if tickets.len() < 5 => {
                    let roi = if rng.random_bool(0.5) {
                        single(rng.random_range(-2..=2), 0, 0)
                    } else {
                        RegionOfInterest::lod(
                            DVec3::new(rng.random_range(-3.0..3.0), rng.random_range(-1.0..1.0), 0.0),
                            rng.random_range(0.0..1.6),
                            rng.random_range(0..=1),
                        )
                    };
                    tickets.push(m.create_ticket_manual(roi));
                }
                1 if !tickets.is_empty() => {
                    let i = rng.random_range(0..tickets.len());
                    let ticket = tickets.swap_remove(i);
                    if step % 2 == 0 {
                        m.dispose_ticket(&ticket);
                    } else {
                        ticket.dispose();
                    }
                }
                _ => {
                    for ticket in &tickets {
                        let dx: f64 = rng.random_range(-0.7..0.7);
                        ticket.update(|roi| match roi {
                            RegionOfInterest::Multi { center, .. } => center.x += dx,
                            RegionOfInterest::Single(c) => c.y += dx.signum() as i32,
                        });
                    }
                }
            }
            m.reconcile();

            let mut expected: HashMap<CellCoord, u32> = HashMap::new();
            for ticket in &tickets {
                ticket
                    .roi()
                    .for_each_affected_cell(|c| *expected.entry(c).or_default() += 1);
            }
            assert_eq!(m.loaded_cells().count(), expected.len(), "step {step}");
            for (coord, count) in &expected {
                assert_eq!(m.refcount(*coord), *count, "step {step} at {coord}");
            }
            assert_eq!(m.live_references(), tickets.len());
        }
    }

    #[test]
    fn overlapping_tickets_share_one_task() {
        let (mut m, generator) = sync_manager();
        let c = CellCoord::new(0, 0, 0);
        let a = m.create_ticket_manual(single(0, 0, 0));
        let b = m.create_ticket_manual(single(0, 0, 0));
        let _c = m.create_ticket_manual(RegionOfInterest::multi(DVec3::ZERO, 0.2));
        m.reconcile();
        assert_eq!(generator.calls(), 1);
        assert_eq!(m.refcount(c), 3);

        m.dispose_ticket(&a);
        m.reconcile();
        assert_eq!(m.refcount(c), 2);
        assert!(m.is_complete(c));
        assert!(m.force_load(&b).is_ok());
        assert_eq!(generator.calls(), 1);
    }

    #[test]
    fn same_pass_additions_aggregate() {
        let (mut m, generator) = sync_manager();
        let a = m.create_ticket_manual(single(5, 0, 0));
        let b = m.create_ticket_manual(single(6, 0, 0));
        // both move onto the same cell before the next pass
        a.set_roi(single(7, 0, 0));
        b.set_roi(single(7, 0, 0));
        m.reconcile();
        assert_eq!(m.refcount(CellCoord::new(7, 0, 0)), 2);
        assert!(!m.is_loaded(CellCoord::new(5, 0, 0)));
        assert_eq!(generator.calls(), 3);
    }

    #[test]
    fn reloading_after_eviction_generates_fresh_payload() {
        let (mut m, generator) = sync_manager();
        let c = CellCoord::new(2, 2, 2);
        let first = m.create_ticket_manual(RegionOfInterest::single(c));
        let old = m.force_load_cell(&first, c).unwrap();
        m.dispose_ticket(&first);
        m.reconcile();

        let second = m.create_ticket_manual(RegionOfInterest::single(c));
        let new = m.force_load_cell(&second, c).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_ne!(old.get(ElementId(0)), new.get(ElementId(0)));
        assert_eq!(generator.calls(), 2);
    }

    #[test]
    fn failed_generation_is_not_cached() {
        let mut m = StreamManager::new(
            StreamConfig::synchronous(0),
            Flaky {
                failures: AtomicUsize::new(1),
            },
        )
        .unwrap();
        let c = CellCoord::new(0, 0, 0);
        let ticket = m.create_ticket_manual(RegionOfInterest::single(c));

        let err = m.force_load(&ticket).unwrap_err();
        assert!(matches!(err, StreamError::Generation { coord, .. } if coord == c));
        assert!(m.get_completed(c).is_none());
        assert_eq!(m.refcount(c), 1);
        assert_eq!(m.stats().generation_failures, 1);

        assert!(m.force_load(&ticket).is_ok());
        assert!(m.get_completed(c).is_some());
    }

    #[test]
    fn async_failure_leaves_slot_empty_until_next_load() {
        let mut m = StreamManager::new(
            StreamConfig {
                worker_threads: 1,
                async_generation: true,
                seed: 0,
            },
            Flaky {
                failures: AtomicUsize::new(1),
            },
        )
        .unwrap();
        let c = CellCoord::new(0, 0, 0);
        let _first = m.create_ticket_manual(RegionOfInterest::single(c));
        for _ in 0..2000 {
            m.reconcile();
            if m.stats().generation_failures == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(m.stats().generation_failures, 1);
        assert!(m.get_completed(c).is_none());
        assert!(m.is_loaded(c));
        assert_eq!(m.refcount(c), 1);

        // reconcile alone does not retry
        m.reconcile();
        assert_eq!(m.stats().tasks_spawned, 1);

        let _second = m.create_ticket_manual(RegionOfInterest::single(c));
        assert_eq!(m.stats().tasks_spawned, 2);
        assert_eq!(m.refcount(c), 2);
        for _ in 0..2000 {
            m.reconcile();
            if m.is_complete(c) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(m.get_completed(c).is_some());
        assert_eq!(m.stats().generation_failures, 1);
    }

    #[test]
    fn panicking_generator_reports_failure() {
        let mut m = StreamManager::new(StreamConfig::synchronous(0), Exploding).unwrap();
        let ticket = m.create_ticket_manual(single(0, 0, 0));
        match m.force_load(&ticket) {
            Err(StreamError::Generation {
                source: GenerationError::Panicked(msg),
                ..
            }) => assert!(msg.contains("blew up")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn async_generation_completes_through_reconcile() {
        let generator = Counting::default();
        let mut m = StreamManager::new(
            StreamConfig {
                worker_threads: 2,
                async_generation: true,
                seed: 3,
            },
            generator.clone(),
        )
        .unwrap();
        let ticket = m.create_ticket_manual(RegionOfInterest::multi(DVec3::ZERO, 1.0));
        assert!(reconcile_until(&mut m, |m| m.is_ticket_complete(&ticket)));
        assert_eq!(generator.calls(), 27);
        assert_eq!(m.stats().cells_loaded, 27);

        let mut visited = 0;
        m.enumerate(&ticket, |_, _| visited += 1);
        assert_eq!(visited, 27);
    }

    #[test]
    fn queued_work_is_cancelled_and_running_work_discarded() {
        let (generator, started, release) = gated();
        let mut m = StreamManager::new(one_worker(), generator.clone()).unwrap();
        let a_cell = CellCoord::new(0, 0, 0);

        let a = m.create_ticket_manual(RegionOfInterest::single(a_cell));
        assert_eq!(started.recv_timeout(Duration::from_secs(5)), Ok(a_cell));
        let b = m.create_ticket_manual(single(1, 0, 0));

        m.dispose_ticket(&b);
        m.dispose_ticket(&a);
        assert!(!m.is_loaded(a_cell));

        release.send(()).unwrap();
        assert!(reconcile_until(&mut m, |m| m.stats().tasks_discarded == 1));
        assert!(m.get_completed(a_cell).is_none());
        assert_eq!(m.loaded_cells().count(), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.stats().tasks_spawned, 2);
    }

    #[test]
    fn reload_adopts_in_flight_task() {
        let (generator, started, release) = gated();
        let mut m = StreamManager::new(one_worker(), generator.clone()).unwrap();
        let c = CellCoord::new(0, 0, 0);

        let first = m.create_ticket_manual(RegionOfInterest::single(c));
        assert_eq!(started.recv_timeout(Duration::from_secs(5)), Ok(c));
        m.dispose_ticket(&first);

        let again = m.create_ticket_manual(RegionOfInterest::single(c));
        assert!(m.is_loaded(c));
        assert_eq!(m.stats().tasks_spawned, 1);

        release.send(()).unwrap();
        let loaded = m.force_load(&again).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.stats().tasks_discarded, 0);
    }

    #[test]
    fn enumerate_uses_last_applied_region() {
        let (mut m, _) = sync_manager();
        let ticket = m.create_ticket_manual(single(0, 0, 0));
        m.reconcile();
        ticket.set_roi(single(9, 0, 0));

        let mut seen = Vec::new();
        m.enumerate(&ticket, |coord, _| seen.push(coord));
        assert_eq!(seen, vec![CellCoord::new(0, 0, 0)]);

        m.reconcile();
        seen.clear();
        m.enumerate(&ticket, |coord, _| seen.push(coord));
        assert_eq!(seen, vec![CellCoord::new(9, 0, 0)]);
    }

    #[test]
    fn scope_drop_releases_on_next_reconcile() {
        let (mut m, _) = sync_manager();
        let mut scope = TicketScope::new();
        m.create_ticket(&mut scope, RegionOfInterest::multi(DVec3::ZERO, 0.4));
        let origin = CellCoord::new(0, 0, 0);
        assert!(m.is_loaded(origin));

        drop(scope);
        assert_eq!(m.live_references(), 0);
        m.reconcile();
        assert!(!m.is_loaded(origin));
        assert_eq!(m.stats().cells_evicted, 1);
    }

    #[test]
    fn child_ticket_holds_parent_cell() {
        let (mut m, children) = child_manager();
        let cell = CellCoord::new(1, 0, 0);
        let id = ChildId::new(cell, ElementId(1));
        let ticket = m.create_child_ticket_manual(Some(id));
        assert_eq!(m.refcount(cell), 1);
        assert_eq!(m.child_refcount(id), 1);

        let full = m.force_load_child(&ticket).unwrap();
        assert_eq!(full.generation, 0);
        assert_eq!(children.calls.load(Ordering::SeqCst), 1);
        assert!(m.element(id).is_some());

        m.dispose_child_ticket(&ticket);
        m.reconcile();
        assert!(m.get_child(id).is_none());
        assert!(!m.is_loaded(cell));
    }

    #[test]
    fn waiting_child_starts_once_parent_completes() {
        let (mut m, _) = child_manager();
        let id = ChildId::new(CellCoord::new(0, 3, 0), ElementId(2));
        let mut scope = TicketScope::new();
        m.create_child_ticket(&mut scope, Some(id));
        assert!(m.get_child(id).is_none());

        m.reconcile();
        assert!(m.get_child(id).is_some());
        assert_eq!(m.stats().total_children, 1);
    }

    #[test]
    fn child_with_nested_references_outlives_its_ticket() {
        let (mut m, children) = child_manager();
        let cell = CellCoord::new(0, 0, 0);
        let id = ChildId::new(cell, ElementId(0));
        let ticket = m.create_child_ticket_manual(Some(id));
        m.force_load_child(&ticket).unwrap();

        children.nested.store(1, Ordering::SeqCst);
        m.dispose_child_ticket(&ticket);
        m.tick();
        assert!(m.get_child(id).is_some());
        // liveness only looks downward
        assert!(!m.is_loaded(cell));

        m.tick();
        let ticks = m.get_child(id).map(|f| f.ticks.load(Ordering::SeqCst));
        assert_eq!(ticks, Some(2));

        children.nested.store(0, Ordering::SeqCst);
        m.tick();
        assert!(m.get_child(id).is_none());
    }

    #[test]
    fn retargeting_child_ticket_moves_references() {
        let (mut m, _) = child_manager();
        let a = ChildId::new(CellCoord::new(0, 0, 0), ElementId(0));
        let b = ChildId::new(CellCoord::new(4, 0, 0), ElementId(0));
        let ticket = m.create_child_ticket_manual(Some(a));
        m.reconcile();
        ticket.set_target(Some(b));
        m.reconcile();
        assert_eq!(m.child_refcount(a), 0);
        assert_eq!(m.child_refcount(b), 1);
        assert!(!m.is_loaded(a.cell));
        assert!(m.is_loaded(b.cell));

        ticket.set_target(None);
        m.reconcile();
        assert_eq!(m.loaded_cells().count(), 0);
    }

    #[test]
    fn missing_element_is_reported() {
        let (mut m, _) = child_manager();
        let id = ChildId::new(CellCoord::new(0, 0, 0), ElementId(40));
        let ticket = m.create_child_ticket_manual(Some(id));
        assert!(matches!(
            m.force_load_child(&ticket),
            Err(StreamError::NoSuchElement(missing)) if missing == id
        ));
    }

    #[test]
    #[should_panic(expected = "not covered")]
    fn forcing_uncovered_cell_panics() {
        let (mut m, _) = sync_manager();
        let ticket = m.create_ticket_manual(single(0, 0, 0));
        let _ = m.force_load_cell(&ticket, CellCoord::new(1, 0, 0));
    }

    #[test]
    #[should_panic(expected = "another manager")]
    fn foreign_ticket_panics() {
        let (mut a, _) = sync_manager();
        let (mut b, _) = sync_manager();
        let ticket = a.create_ticket_manual(single(0, 0, 0));
        let _ = b.force_load(&ticket);
    }

    #[test]
    #[should_panic(expected = "used after dispose")]
    fn disposed_ticket_panics() {
        let (mut m, _) = sync_manager();
        let ticket = m.create_ticket_manual(single(0, 0, 0));
        ticket.dispose();
        let _ = m.force_load(&ticket);
    }

    #[test]
    fn pool_is_shared_with_nested_managers() {
        let outer = StreamManager::new(one_worker(), Counting::default()).unwrap();
        let inner = StreamManager::with_pool(
            StreamConfig::default(),
            outer.pool().clone(),
            Counting::default(),
            NoChildren,
        );
        assert_eq!(inner.pool().threads(), 1);
        assert_ne!(inner.id(), outer.id());
        fn assert_send<T: Send>(_: &T) {}
        assert_send(&inner);
    }
}
