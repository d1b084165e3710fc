//! Generation tasks and the worker pool that runs them.
//!
//! Each task reports back over its own one-shot channel. A shared status word
//! lets the driver cancel work that has not started yet; work that is already
//! running always finishes and the driver decides whether to keep the result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::config::StreamConfig;
use crate::error::{GenerationError, StreamError};

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

/// Lifecycle of a [`GenerationTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Finished,
    Cancelled,
}

/// Handle to one in-flight generation job.
#[derive(Debug)]
pub struct GenerationTask<T> {
    status: Arc<AtomicU8>,
    result: Receiver<Result<T, GenerationError>>,
}

impl<T> GenerationTask<T> {
    pub fn status(&self) -> TaskStatus {
        match self.status.load(Ordering::Acquire) {
            QUEUED => TaskStatus::Queued,
            RUNNING => TaskStatus::Running,
            FINISHED => TaskStatus::Finished,
            _ => TaskStatus::Cancelled,
        }
    }

    /// Cancel the job if it has not started. Returns false once it is running.
    pub fn cancel(&self) -> bool {
        self.status
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Non-blocking poll for the result.
    pub fn try_take(&self) -> Option<Result<T, GenerationError>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(GenerationError::Cancelled)),
        }
    }

    /// Block until the job reports.
    pub fn wait(&self) -> Result<T, GenerationError> {
        self.result
            .recv()
            .unwrap_or(Err(GenerationError::Cancelled))
    }
}

/// Where generation jobs run.
///
/// Clones share the same threads, so nested managers can reuse their
/// parent's pool. [`WorkerPool::inline`] runs every job on the caller.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl WorkerPool {
    pub fn new(config: &StreamConfig) -> Result<Self, StreamError> {
        if !config.async_generation {
            return Ok(Self::inline());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("cosmos-gen-{i}"))
            .build()?;
        tracing::debug!(threads = pool.current_num_threads(), "generation pool started");
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    pub fn inline() -> Self {
        Self { pool: None }
    }

    pub fn is_async(&self) -> bool {
        self.pool.is_some()
    }

    /// Worker thread count, 0 for inline.
    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.current_num_threads())
    }

    /// Queue `job`. Panics inside the job are reported as
    /// [`GenerationError::Panicked`].
    pub fn spawn<T, F>(&self, job: F) -> GenerationTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, GenerationError> + Send + 'static,
    {
        let status = Arc::new(AtomicU8::new(QUEUED));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker_status = Arc::clone(&status);

        let run = move || {
            if worker_status
                .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(result) => result,
                Err(payload) => Err(GenerationError::Panicked(panic_message(payload.as_ref()))),
            };
            worker_status.store(FINISHED, Ordering::Release);
            // the driver may have dropped the task already
            let _ = tx.send(result);
        };

        match &self.pool {
            Some(pool) => pool.spawn(run),
            None => run(),
        }
        GenerationTask { status, result: rx }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
