//! Streaming: ticketed, reference-counted lazy generation of sparse grid cells.
//!
//! Consumers hold [`Ticket`]s describing a [`RegionOfInterest`]. The
//! [`StreamManager`] keeps exactly the cells some live ticket covers resident,
//! generating each one at most once on a shared [`WorkerPool`] and evicting it
//! when its last reference goes away. Cell payloads can be expanded element by
//! element through [`ChildTicket`]s and a [`ChildGenerator`].
//!
//! # Invariants
//! - Only the driver thread mutates a manager; generators never touch it.
//! - Installed payloads are immutable and shared through `Arc`.
//! - Blocking happens only inside the `force_load*` family.

mod config;
mod error;
mod manager;
mod payload;
mod roi;
mod slot;
mod stats;
mod task;
mod ticket;

pub use config::StreamConfig;
pub use error::{GenerationError, StreamError};
pub use manager::StreamManager;
pub use payload::{CellGenerator, ChildGenerator, ChildId, Nested, NoChildren, Payload};
pub use roi::{CellBounds, RegionOfInterest, RoiDiff};
pub use stats::{StreamStats, TickHistory, TickSample};
pub use task::{GenerationTask, TaskStatus, WorkerPool};
pub use ticket::{ChildTicket, Dispose, ManagerId, Ticket, TicketScope};

pub fn crate_info() -> &'static str {
    "cosmos-stream v0.1.0"
}
