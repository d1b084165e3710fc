use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::seed::mix_seed;

/// Unique identifier for a ticket handed out by a stream manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

/// Address of one cube of the sparse grid.
///
/// A cell at `level` has an edge length of `2^level` grid units and is centred
/// on its lattice point, so `(x, y, z, level)` spans
/// `[(x - 0.5) * edge, (x + 0.5) * edge)` on each axis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub level: u8,
}

impl CellCoord {
    /// Highest supported level; keeps `2^level` exactly representable.
    pub const MAX_LEVEL: u8 = 52;

    /// A level-0 cell.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z, level: 0 }
    }

    pub const fn at_level(level: u8, x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z, level }
    }

    pub fn from_ivec(level: u8, v: IVec3) -> Self {
        Self::at_level(level, v.x, v.y, v.z)
    }

    pub fn as_ivec(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// The cell at `level` that contains `point` (grid units).
    pub fn containing(level: u8, point: DVec3) -> Self {
        let edge = Self::edge_length_at(level);
        let v = (point / edge + DVec3::splat(0.5)).floor().as_ivec3();
        Self::from_ivec(level, v)
    }

    pub fn edge_length_at(level: u8) -> f64 {
        assert!(level <= Self::MAX_LEVEL, "cell level {level} out of range");
        (1u64 << level) as f64
    }

    pub fn edge_length(&self) -> f64 {
        Self::edge_length_at(self.level)
    }

    pub fn center(&self) -> DVec3 {
        self.as_ivec().as_dvec3() * self.edge_length()
    }

    pub fn min_bound(&self) -> DVec3 {
        self.center() - DVec3::splat(self.edge_length() * 0.5)
    }

    pub fn max_bound(&self) -> DVec3 {
        self.center() + DVec3::splat(self.edge_length() * 0.5)
    }

    /// Half-open containment test, matching [`CellCoord::containing`].
    pub fn contains_point(&self, point: DVec3) -> bool {
        let min = self.min_bound();
        let max = self.max_bound();
        point.cmpge(min).all() && point.cmplt(max).all()
    }

    /// Deterministic generation seed for this cell under a base seed.
    pub fn seed(&self, base: u64) -> u64 {
        let mut seed = mix_seed(base, self.level as u64);
        seed = mix_seed(seed, self.x as u32 as u64);
        seed = mix_seed(seed, self.y as u32 as u64);
        mix_seed(seed, self.z as u32 as u64)
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#L{}:({}, {}, {})", self.level, self.x, self.y, self.z)
    }
}
