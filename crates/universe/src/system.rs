//! Galaxy sectors (cells of stars) and the star systems expanded from them.
//!
//! Sectors form a level of detail hierarchy: level 0 holds the faint stars,
//! and each level above holds a band of brighter stars in cells twice as wide,
//! so a viewer can stream coarse levels far out and fine levels nearby.

use cosmos_common::{CellCoord, content_rng};
use cosmos_octree::{ElementId, OctreeConfig};
use cosmos_stream::{CellGenerator, ChildGenerator, GenerationError, Nested, Payload};
use glam::DVec3;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::galaxy::{GalaxyInfo, GalaxyKind, inclusive};

const MIN_MASS_MSOL: f64 = 0.08;
const MAX_MASS_MSOL: f64 = 40.0;
/// Faintest luminosity stored above level 0.
const LOD_LUMINOSITY_LSOL: f64 = 1.0;

/// Luminosity band `[lo, hi)` of the stars stored in sectors at `level`.
///
/// Bands are disjoint, so every star lives at exactly one level.
pub fn luminosity_band(level: u8) -> (f64, f64) {
    let floor = |l: u8| match l {
        0 => 0.0,
        l => LOD_LUMINOSITY_LSOL * 4f64.powi(i32::from(l) - 1),
    };
    (floor(level), floor(level.saturating_add(1)))
}

fn mass_for_luminosity(luminosity_lsol: f64) -> f64 {
    luminosity_lsol.powf(1.0 / 3.5)
}

/// Cheap per-star summary stored in a galaxy sector payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarInfo {
    pub seed: u64,
    pub mass_msol: f64,
    pub age_myr: f64,
    pub luminosity_lsol: f64,
    pub temperature_k: f64,
}

impl StarInfo {
    fn from_mass(seed: u64, mass_msol: f64, age_myr: f64) -> Self {
        Self {
            seed,
            mass_msol,
            age_myr,
            luminosity_lsol: mass_msol.powf(3.5),
            temperature_k: 5772.0 * mass_msol.powf(0.505),
        }
    }
}

/// Scatters stars through the sectors of one galaxy.
#[derive(Debug, Clone)]
pub struct GalaxySectorGenerator {
    galaxy: GalaxyInfo,
    stars_per_sector: (u32, u32),
    radius: f64,
    octree: OctreeConfig,
}

impl GalaxySectorGenerator {
    pub fn new(
        galaxy: GalaxyInfo,
        stars_per_sector: (u32, u32),
        radius: f64,
        octree: OctreeConfig,
    ) -> Self {
        Self {
            galaxy,
            stars_per_sector,
            radius: radius.max(f64::EPSILON),
            octree,
        }
    }

    /// Relative stellar density at a galaxy-local position, in `[0, 1]`.
    pub fn density(&self, p: DVec3) -> f64 {
        match self.galaxy.kind {
            GalaxyKind::Spiral => {
                // thin disc in the xz plane
                let planar = DVec3::new(p.x, 0.0, p.z).length() / self.radius;
                let height = p.y.abs() / (self.radius * 0.1);
                (-planar - height).exp()
            }
            GalaxyKind::Elliptical => {
                let r = p.length() / self.radius;
                (-r * r).exp()
            }
            GalaxyKind::Irregular => {
                let r = p.length() / self.radius;
                (-r).exp() * 0.5
            }
        }
    }
}

impl CellGenerator for GalaxySectorGenerator {
    type Info = StarInfo;

    fn generate(&self, coord: CellCoord, seed: u64) -> Result<Payload<StarInfo>, GenerationError> {
        let (band_lo, band_hi) = luminosity_band(coord.level);
        let min_mass = mass_for_luminosity(band_lo).max(MIN_MASS_MSOL);
        let max_mass = mass_for_luminosity(band_hi).min(MAX_MASS_MSOL);
        if min_mass >= max_mass {
            return Ok(Payload::empty(coord));
        }

        let mut rng = content_rng(seed);
        let (lo, hi) = (coord.min_bound(), coord.max_bound());
        let attempts = rng.random_range(inclusive(self.stars_per_sector));

        let mut stars = Vec::new();
        for _ in 0..attempts {
            let p = DVec3::new(
                rng.random_range(lo.x..hi.x),
                rng.random_range(lo.y..hi.y),
                rng.random_range(lo.z..hi.z),
            );
            if rng.random::<f64>() >= self.density(p) {
                continue;
            }
            // bottom-heavy within the level's band
            let mass = min_mass + (max_mass - min_mass) * rng.random::<f64>().powi(2);
            let age = rng.random_range(0.0..self.galaxy.age_myr.max(f64::EPSILON));
            stars.push((p, StarInfo::from_mass(rng.random(), mass, age)));
        }
        tracing::trace!(%coord, stars = stars.len(), "galaxy sector generated");
        Ok(Payload::build(coord, self.octree, stars))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    Rocky,
    IceGiant,
    GasGiant,
}

/// One planet of a star system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub name: String,
    pub kind: BodyKind,
    pub orbit_radius_au: f64,
    pub mass_earth: f64,
}

/// Fully generated star system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarSystem {
    pub position: DVec3,
    pub star: StarInfo,
    pub bodies: Vec<Body>,
}

impl Nested for StarSystem {}

/// Expands one star of a galaxy sector into its planets.
#[derive(Debug, Clone, Copy, Default)]
pub struct StarSystemGenerator;

impl ChildGenerator<StarInfo> for StarSystemGenerator {
    type Full = StarSystem;

    fn generate(
        &self,
        parent: &Payload<StarInfo>,
        element: ElementId,
        seed: u64,
    ) -> Result<StarSystem, GenerationError> {
        let star_ref = parent.element(element).ok_or_else(|| {
            GenerationError::failed(format!("sector {} has no star {element}", parent.coord()))
        })?;
        let star = *star_ref.value;
        let mut rng = content_rng(seed ^ star.seed);

        let frost_line = 2.7 * star.luminosity_lsol.sqrt();
        let count = rng.random_range(0..=8u32);
        let mut orbit = rng.random_range(0.2..0.6) * star.luminosity_lsol.sqrt().max(0.1);
        let mut bodies = Vec::with_capacity(count as usize);
        for i in 0..count {
            let (kind, mass_earth) = if orbit < frost_line {
                (BodyKind::Rocky, rng.random_range(0.05..5.0))
            } else if rng.random_bool(0.6) {
                (BodyKind::GasGiant, rng.random_range(20.0..400.0))
            } else {
                (BodyKind::IceGiant, rng.random_range(8.0..20.0))
            };
            bodies.push(Body {
                name: planet_letter(i).to_string(),
                kind,
                orbit_radius_au: orbit,
                mass_earth,
            });
            // geometric spacing
            orbit *= rng.random_range(1.4..2.0);
        }

        Ok(StarSystem {
            position: star_ref.position,
            star,
            bodies,
        })
    }
}

fn planet_letter(index: u32) -> char {
    char::from_u32('b' as u32 + index).unwrap_or('?')
}
