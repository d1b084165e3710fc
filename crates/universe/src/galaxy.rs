//! Universe cells scatter galaxies; each expanded galaxy streams its own sectors.

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use cosmos_common::{CellCoord, content_rng};
use cosmos_octree::{ElementId, OctreeConfig};
use cosmos_stream::{
    CellGenerator, ChildGenerator, ChildId, GenerationError, Nested, Payload, StreamConfig,
    StreamManager, WorkerPool,
};
use glam::DVec3;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::UniverseConfig;
use crate::system::{GalaxySectorGenerator, StarSystemGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GalaxyKind {
    Spiral,
    Elliptical,
    Irregular,
}

impl std::fmt::Display for GalaxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Spiral => "spiral",
            Self::Elliptical => "elliptical",
            Self::Irregular => "irregular",
        };
        f.write_str(name)
    }
}

/// Cheap per-galaxy summary stored in a universe cell payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GalaxyInfo {
    pub kind: GalaxyKind,
    pub seed: u64,
    pub age_myr: f64,
}

/// Scatters galaxies through universe cells.
#[derive(Debug, Clone)]
pub struct UniverseGenerator {
    galaxies_per_cell: (u32, u32),
    octree: OctreeConfig,
}

impl UniverseGenerator {
    pub fn new(config: &UniverseConfig) -> Self {
        Self {
            galaxies_per_cell: config.galaxies_per_cell,
            octree: config.octree,
        }
    }
}

impl CellGenerator for UniverseGenerator {
    type Info = GalaxyInfo;

    fn generate(&self, coord: CellCoord, seed: u64) -> Result<Payload<GalaxyInfo>, GenerationError> {
        let mut rng = content_rng(seed);
        let (lo, hi) = (coord.min_bound(), coord.max_bound());
        let count = rng.random_range(inclusive(self.galaxies_per_cell));

        let galaxies = (0..count).map(|_| {
            let position = DVec3::new(
                rng.random_range(lo.x..hi.x),
                rng.random_range(lo.y..hi.y),
                rng.random_range(lo.z..hi.z),
            );
            let kind = match rng.random::<f64>() {
                r if r < 0.6 => GalaxyKind::Spiral,
                r if r < 0.9 => GalaxyKind::Elliptical,
                _ => GalaxyKind::Irregular,
            };
            let info = GalaxyInfo {
                kind,
                seed: rng.random(),
                age_myr: rng.random_range(100.0..10_000.0),
            };
            (position, info)
        });
        let payload = Payload::build(coord, self.octree, galaxies.collect::<Vec<_>>());
        tracing::trace!(%coord, galaxies = payload.len(), "universe cell generated");
        Ok(payload)
    }
}

/// `(a, b)` as an inclusive range, whichever way round it was configured.
pub(crate) fn inclusive((a, b): (u32, u32)) -> std::ops::RangeInclusive<u32> {
    a.min(b)..=a.max(b)
}

/// Stream manager over the sectors of one galaxy.
pub type GalaxySectors = StreamManager<GalaxySectorGenerator, StarSystemGenerator>;

/// A fully generated galaxy and its nested sector manager.
#[derive(Debug)]
pub struct Galaxy {
    pub id: ChildId,
    pub position: DVec3,
    pub info: GalaxyInfo,
    sectors: Mutex<GalaxySectors>,
}

impl Galaxy {
    /// Run `f` with exclusive access to the galaxy's sector manager.
    ///
    /// The outer manager may tick while `f` runs (for example when `f` ticks
    /// the universe); the galaxy then counts as referenced and skips its own
    /// tick instead of waiting on itself.
    pub fn with_sectors<R>(&self, f: impl FnOnce(&mut GalaxySectors) -> R) -> R {
        f(&mut *self.sectors.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// The sector manager, unless `with_sectors` holds it.
    fn try_lock(&self) -> Option<MutexGuard<'_, GalaxySectors>> {
        match self.sectors.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl Nested for Galaxy {
    fn nested_references(&self) -> usize {
        // busy in `with_sectors`, so someone is using it
        self.try_lock().map_or(1, |sectors| sectors.live_references())
    }

    fn tick(&self) {
        match self.try_lock() {
            Some(mut sectors) => sectors.tick(),
            None => tracing::debug!(id = %self.id, "galaxy busy, tick skipped"),
        }
    }
}

/// Expands a galaxy element into a [`Galaxy`] with its own sector manager.
#[derive(Debug, Clone)]
pub struct GalaxyGenerator {
    pool: WorkerPool,
    stream: StreamConfig,
    stars_per_sector: (u32, u32),
    galaxy_radius: f64,
    octree: OctreeConfig,
}

impl GalaxyGenerator {
    /// Nested managers run on `pool`, shared with the universe manager.
    pub fn new(config: &UniverseConfig, pool: WorkerPool) -> Self {
        Self {
            pool,
            stream: config.stream.clone(),
            stars_per_sector: config.stars_per_sector,
            galaxy_radius: config.galaxy_radius,
            octree: config.octree,
        }
    }
}

impl ChildGenerator<GalaxyInfo> for GalaxyGenerator {
    type Full = Galaxy;

    fn generate(
        &self,
        parent: &Payload<GalaxyInfo>,
        element: ElementId,
        seed: u64,
    ) -> Result<Galaxy, GenerationError> {
        let entry = parent.element(element).ok_or_else(|| {
            GenerationError::failed(format!("cell {} has no galaxy {element}", parent.coord()))
        })?;
        let info = *entry.value;
        let stream = StreamConfig {
            seed: seed ^ info.seed,
            ..self.stream.clone()
        };
        let sectors = StreamManager::with_pool(
            stream,
            self.pool.clone(),
            GalaxySectorGenerator::new(info, self.stars_per_sector, self.galaxy_radius, self.octree),
            StarSystemGenerator,
        );
        let id = ChildId::new(parent.coord(), element);
        tracing::debug!(%id, kind = %info.kind, "galaxy generated");
        Ok(Galaxy {
            id,
            position: entry.position,
            info,
            sectors: Mutex::new(sectors),
        })
    }
}
