//! Consumer-held tickets and the scope that disposes them.
//!
//! A ticket is a cheap clonable handle onto shared state: an id, the manager
//! that issued it, the mutable target and a disposed flag. Consumers mutate the
//! target in place; the manager picks the change up on its next reconcile and
//! diffs it against the snapshot it applied last time.
//!
//! # Invariants
//! - Once disposed, a ticket never becomes live again.
//! - Mutating a disposed ticket is a programming error and panics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cosmos_common::TicketId;

use crate::payload::ChildId;
use crate::roi::RegionOfInterest;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the manager that issued a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(pub u64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something a [`TicketScope`] can release.
pub trait Dispose: Send + Sync {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

#[derive(Debug)]
pub(crate) struct TicketShared<T> {
    id: TicketId,
    manager: ManagerId,
    target: Mutex<T>,
    disposed: AtomicBool,
}

impl<T: Copy> TicketShared<T> {
    fn new(manager: ManagerId, target: T) -> Arc<Self> {
        Arc::new(Self {
            id: TicketId::new(),
            manager,
            target: Mutex::new(target),
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> TicketId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> T {
        *self.lock()
    }

    fn update(&self, f: impl FnOnce(&mut T)) {
        assert!(
            !self.disposed.load(Ordering::Acquire),
            "ticket {:?} used after dispose",
            self.id
        );
        f(&mut *self.lock());
    }
}

impl<T: Send> Dispose for TicketShared<T> {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Handle describing which cells a consumer wants resident.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub(crate) shared: Arc<TicketShared<RegionOfInterest>>,
}

impl Ticket {
    pub(crate) fn new(manager: ManagerId, roi: RegionOfInterest) -> Self {
        Self {
            shared: TicketShared::new(manager, roi),
        }
    }

    pub fn id(&self) -> TicketId {
        self.shared.id
    }

    pub fn manager(&self) -> ManagerId {
        self.shared.manager
    }

    /// Current region; the manager applies it on the next reconcile.
    pub fn roi(&self) -> RegionOfInterest {
        self.shared.snapshot()
    }

    pub fn set_roi(&self, roi: RegionOfInterest) {
        self.shared.update(|r| *r = roi);
    }

    /// Mutate the region in place, e.g. to move a `Multi` centre.
    pub fn update(&self, f: impl FnOnce(&mut RegionOfInterest)) {
        self.shared.update(f);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Mark the ticket dead. Its cells are released on the next reconcile.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

/// Handle keeping one child element (and its parent cell) resident.
#[derive(Debug, Clone)]
pub struct ChildTicket {
    pub(crate) shared: Arc<TicketShared<Option<ChildId>>>,
}

impl ChildTicket {
    pub(crate) fn new(manager: ManagerId, target: Option<ChildId>) -> Self {
        Self {
            shared: TicketShared::new(manager, target),
        }
    }

    pub fn id(&self) -> TicketId {
        self.shared.id
    }

    pub fn manager(&self) -> ManagerId {
        self.shared.manager
    }

    pub fn target(&self) -> Option<ChildId> {
        self.shared.snapshot()
    }

    pub fn set_target(&self, target: Option<ChildId>) {
        self.shared.update(|t| *t = target);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

/// Disposes every ticket created through it when dropped or closed.
#[derive(Default)]
pub struct TicketScope {
    tickets: Vec<Arc<dyn Dispose>>,
}

impl TicketScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn adopt(&mut self, ticket: Arc<dyn Dispose>) {
        self.tickets.push(ticket);
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Dispose everything now and keep the scope usable.
    pub fn dispose_all(&mut self) {
        for ticket in self.tickets.drain(..) {
            ticket.dispose();
        }
    }

    pub fn close(mut self) {
        self.dispose_all();
    }
}

impl Drop for TicketScope {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

impl std::fmt::Debug for TicketScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketScope")
            .field("tickets", &self.tickets.len())
            .finish()
    }
}

/// Manager-side pairing of a ticket with the target it last applied.
#[derive(Debug)]
pub(crate) struct Tracker<T> {
    pub(crate) shared: Arc<TicketShared<T>>,
    pub(crate) applied: Option<T>,
}

impl<T: Copy + PartialEq + Send> Tracker<T> {
    pub(crate) fn new(shared: Arc<TicketShared<T>>) -> Self {
        Self {
            shared,
            applied: None,
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Swap in the current target. Returns the previous snapshot, or `None`
    /// when nothing changed since the last pass.
    pub(crate) fn advance(&mut self) -> Option<(Option<T>, T)> {
        let current = self.shared.snapshot();
        if self.applied == Some(current) {
            return None;
        }
        let previous = self.applied.replace(current);
        Some((previous, current))
    }
}
