//! Procedural universe built on nested stream managers.
//!
//! Universe cells hold galaxies. Expanding a galaxy yields a [`Galaxy`] that
//! owns its own sector manager, whose cells hold stars and whose children are
//! [`StarSystem`]s. Everything is derived from the configured seed.

mod config;
mod galaxy;
mod system;
mod universe;

pub use config::{ConfigError, UniverseConfig};
pub use galaxy::{Galaxy, GalaxyGenerator, GalaxyInfo, GalaxyKind, GalaxySectors, UniverseGenerator};
pub use system::{
    Body, BodyKind, GalaxySectorGenerator, StarInfo, StarSystem, StarSystemGenerator, luminosity_band,
};
pub use universe::{SystemId, Universe, UniverseSectors};

pub fn crate_info() -> &'static str {
    "cosmos-universe v0.1.0"
}
