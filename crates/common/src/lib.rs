//! Shared types: cell coordinates, ticket ids, deterministic seeding.
//!
//! # Invariants
//! - `CellCoord` is compared by value; two equal coordinates address the same cube.
//! - Seeds derived from a coordinate are identical on every platform.

mod seed;
mod types;

pub use seed::{ContentRng, content_rng, mix_seed, splitmix64};
pub use types::{CellCoord, TicketId};
