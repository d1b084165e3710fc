//! Regions of interest and their incremental diffs.
//!
//! A `Multi` region is a level of detail pyramid: at level 0 it covers the
//! cells intersecting `center ± radius`, and each level above doubles the
//! radius, up to `max_level`. Far away content is kept resident only at the
//! coarse levels.
//!
//! # Invariants
//! - `roi.diff(&roi)` is empty.
//! - `added` and `removed` of a diff never share a coordinate.

use std::collections::BTreeSet;

use cosmos_common::CellCoord;
use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};

/// Which cells a ticket wants resident.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegionOfInterest {
    /// Exactly one cell, at any level.
    Single(CellCoord),
    /// Every cell intersecting the box `center ± radius * 2^level`, for each
    /// level in `0..=max_level`.
    Multi {
        center: DVec3,
        radius: f64,
        #[serde(default)]
        max_level: u8,
    },
}

/// Inclusive index box covered by a `Multi` region at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellBounds {
    pub level: u8,
    pub min: IVec3,
    pub max: IVec3,
}

impl CellBounds {
    pub fn empty(level: u8) -> Self {
        Self {
            level,
            min: IVec3::ONE,
            max: IVec3::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn contains(&self, v: IVec3) -> bool {
        !self.is_empty() && v.cmpge(self.min).all() && v.cmple(self.max).all()
    }

    /// Number of cells in the box.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let extent = (self.max - self.min).as_i64vec3() + glam::I64Vec3::ONE;
        (extent.x * extent.y * extent.z) as usize
    }

    /// Visit every cell in x, y, z order.
    pub fn for_each(&self, mut f: impl FnMut(CellCoord)) {
        if self.is_empty() {
            return;
        }
        for x in self.min.x..=self.max.x {
            for y in self.min.y..=self.max.y {
                for z in self.min.z..=self.max.z {
                    f(CellCoord::at_level(self.level, x, y, z));
                }
            }
        }
    }
}

/// Cells gained and lost between two regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoiDiff {
    pub added: Vec<CellCoord>,
    pub removed: Vec<CellCoord>,
}

impl RoiDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl RegionOfInterest {
    pub fn single(coord: CellCoord) -> Self {
        Self::Single(coord)
    }

    /// Level-0 cells around `center`.
    pub fn multi(center: DVec3, radius: f64) -> Self {
        Self::lod(center, radius, 0)
    }

    /// Cells around `center` at every level up to `max_level`, the radius
    /// doubling per level.
    pub fn lod(center: DVec3, radius: f64, max_level: u8) -> Self {
        Self::Multi {
            center,
            radius,
            max_level: max_level.min(CellCoord::MAX_LEVEL),
        }
    }

    /// Levels this region touches.
    pub fn levels(&self) -> std::ops::RangeInclusive<u8> {
        match *self {
            Self::Single(c) => c.level..=c.level,
            Self::Multi { max_level, .. } => 0..=max_level.min(CellCoord::MAX_LEVEL),
        }
    }

    /// Index box of a `Multi` region at `level`, `None` for `Single` regions
    /// and levels above `max_level`. A negative radius yields an empty box.
    pub fn bounds(&self, level: u8) -> Option<CellBounds> {
        let Self::Multi { center, radius, .. } = *self else {
            return None;
        };
        if !self.levels().contains(&level) {
            return None;
        }
        if radius < 0.0 || radius.is_nan() {
            return Some(CellBounds::empty(level));
        }
        let edge = CellCoord::edge_length_at(level);
        let reach = DVec3::splat(radius * edge);
        // cells are centred on their lattice point
        let half = DVec3::splat(0.5);
        Some(CellBounds {
            level,
            min: ((center - reach) / edge + half).floor().as_ivec3(),
            max: ((center + reach) / edge + half).floor().as_ivec3(),
        })
    }

    pub fn covers(&self, coord: CellCoord) -> bool {
        match self {
            Self::Single(c) => *c == coord,
            Self::Multi { .. } => self
                .bounds(coord.level)
                .is_some_and(|b| b.contains(coord.as_ivec())),
        }
    }

    /// Visit every covered cell, level by level.
    pub fn for_each_affected_cell(&self, mut f: impl FnMut(CellCoord)) {
        match self {
            Self::Single(c) => f(*c),
            Self::Multi { .. } => {
                for level in self.levels() {
                    if let Some(bounds) = self.bounds(level) {
                        bounds.for_each(&mut f);
                    }
                }
            }
        }
    }

    pub fn affected_cells(&self) -> Vec<CellCoord> {
        let mut cells = Vec::new();
        self.for_each_affected_cell(|c| cells.push(c));
        cells
    }

    pub fn cell_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi { .. } => self
                .levels()
                .filter_map(|level| self.bounds(level))
                .map(|b| b.len())
                .sum(),
        }
    }

    /// Cells this region covers that `previous` did not, and vice versa.
    pub fn diff(&self, previous: &RegionOfInterest) -> RoiDiff {
        match (self, previous) {
            (Self::Single(now), Self::Single(before)) => {
                if now == before {
                    RoiDiff::default()
                } else {
                    RoiDiff {
                        added: vec![*now],
                        removed: vec![*before],
                    }
                }
            }
            (Self::Multi { .. }, Self::Multi { .. }) => {
                let top = (*self.levels().end()).max(*previous.levels().end());
                let mut diff = RoiDiff::default();
                for level in 0..=top {
                    let now = self.bounds(level).unwrap_or(CellBounds::empty(level));
                    let before = previous.bounds(level).unwrap_or(CellBounds::empty(level));
                    diff_boxes(&now, &before, &mut diff);
                }
                diff
            }
            _ => {
                let now: BTreeSet<CellCoord> = self.affected_cells().into_iter().collect();
                let before: BTreeSet<CellCoord> = previous.affected_cells().into_iter().collect();
                RoiDiff {
                    added: now.difference(&before).copied().collect(),
                    removed: before.difference(&now).copied().collect(),
                }
            }
        }
    }
}

fn diff_boxes(now: &CellBounds, before: &CellBounds, diff: &mut RoiDiff) {
    if now == before || (now.is_empty() && before.is_empty()) {
        return;
    }
    now.for_each(|c| {
        if !before.contains(c.as_ivec()) {
            diff.added.push(c);
        }
    });
    before.for_each(|c| {
        if !now.contains(c.as_ivec()) {
            diff.removed.push(c);
        }
    });
}
