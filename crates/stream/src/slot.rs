use std::fmt::Debug;
use std::sync::Arc;

use crate::error::GenerationError;
use crate::task::GenerationTask;

/// Generation state of a slot.
#[derive(Debug)]
pub(crate) enum SlotState<T> {
    Empty,
    Pending(GenerationTask<T>),
    Complete(Arc<T>),
}

/// Outcome of polling a slot's task.
#[derive(Debug)]
pub(crate) enum Polled {
    Idle,
    Installed,
    Failed(GenerationError),
}

/// Refcounted cache entry for one cell or child.
#[derive(Debug)]
pub(crate) struct Slot<K, T> {
    key: K,
    refcount: u32,
    state: SlotState<T>,
}

impl<K: Copy + Debug, T> Slot<K, T> {
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            refcount: 0,
            state: SlotState::Empty,
        }
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self.state, SlotState::Empty)
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending(_))
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.state, SlotState::Complete(_))
    }

    pub(crate) fn get(&self) -> Option<&Arc<T>> {
        match &self.state {
            SlotState::Complete(value) => Some(value),
            _ => None,
        }
    }

    /// Add one reference. Returns true when the caller must start a task.
    pub(crate) fn acquire(&mut self) -> bool {
        self.refcount += 1;
        self.is_empty()
    }

    /// Drop one reference and return the remaining count.
    pub(crate) fn release(&mut self) -> u32 {
        if self.refcount == 0 {
            tracing::warn!(key = ?self.key, "release of unreferenced slot");
        } else {
            self.refcount -= 1;
        }
        self.refcount
    }

    pub(crate) fn start(&mut self, task: GenerationTask<T>) {
        debug_assert!(self.is_empty(), "slot {:?} already has a task", self.key);
        self.state = SlotState::Pending(task);
    }

    /// Install a finished result, if any. Failures return the slot to `Empty`.
    pub(crate) fn poll(&mut self) -> Polled {
        let SlotState::Pending(task) = &self.state else {
            return Polled::Idle;
        };
        match task.try_take() {
            None => Polled::Idle,
            Some(result) => match self.settle(result) {
                Ok(()) => Polled::Installed,
                Err(err) => Polled::Failed(err),
            },
        }
    }

    /// Block on a pending task. Returns the value and whether this call
    /// installed it.
    pub(crate) fn wait(&mut self) -> Result<(Arc<T>, bool), GenerationError> {
        let mut installed = false;
        if let SlotState::Pending(task) = &self.state {
            let result = task.wait();
            self.settle(result)?;
            installed = true;
        }
        match &self.state {
            SlotState::Complete(value) => Ok((Arc::clone(value), installed)),
            _ => Err(GenerationError::Cancelled),
        }
    }

    /// Take the in-flight task, leaving the slot `Empty`.
    pub(crate) fn take_task(&mut self) -> Option<GenerationTask<T>> {
        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Pending(task) => Some(task),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn settle(&mut self, result: Result<T, GenerationError>) -> Result<(), GenerationError> {
        match result {
            Ok(value) => {
                self.state = SlotState::Complete(Arc::new(value));
                Ok(())
            }
            Err(err) => {
                self.state = SlotState::Empty;
                Err(err)
            }
        }
    }
}
