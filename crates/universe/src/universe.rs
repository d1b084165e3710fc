use std::sync::Arc;

use cosmos_stream::{
    ChildId, Payload, StreamError, StreamManager, StreamStats, TicketScope, WorkerPool,
};
use serde::{Deserialize, Serialize};

use crate::config::UniverseConfig;
use crate::galaxy::{Galaxy, GalaxyGenerator, GalaxyInfo, UniverseGenerator};
use crate::system::StarSystem;

/// Stream manager over universe cells, expanding galaxies as children.
pub type UniverseSectors = StreamManager<UniverseGenerator, GalaxyGenerator>;

/// A star system: the galaxy it belongs to plus its address in that galaxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemId {
    pub galaxy: ChildId,
    pub system: ChildId,
}

impl std::fmt::Display for SystemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.galaxy, self.system)
    }
}

/// Explicit context owning the universe's stream manager.
///
/// One driver thread owns the universe and calls [`Universe::tick`] once per
/// update; galaxies tick their nested managers from inside that call.
#[derive(Debug)]
pub struct Universe {
    config: UniverseConfig,
    sectors: UniverseSectors,
}

impl Universe {
    pub fn new(config: UniverseConfig) -> Result<Self, StreamError> {
        let pool = WorkerPool::new(&config.stream)?;
        let sectors = StreamManager::with_pool(
            config.stream.clone(),
            pool.clone(),
            UniverseGenerator::new(&config),
            GalaxyGenerator::new(&config, pool),
        );
        tracing::info!(
            seed = config.stream.seed,
            threads = sectors.pool().threads(),
            "universe created"
        );
        Ok(Self { config, sectors })
    }

    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    pub fn sectors(&self) -> &UniverseSectors {
        &self.sectors
    }

    pub fn sectors_mut(&mut self) -> &mut UniverseSectors {
        &mut self.sectors
    }

    pub fn stats(&self) -> &StreamStats {
        self.sectors.stats()
    }

    /// Keep a galaxy loaded for the lifetime of `scope` and block until it is
    /// generated.
    pub fn load_galaxy(
        &mut self,
        scope: &mut TicketScope,
        id: ChildId,
    ) -> Result<Arc<Galaxy>, StreamError> {
        let ticket = self.sectors.create_child_ticket(scope, Some(id));
        self.sectors.force_load_child(&ticket)
    }

    /// Keep a star system (and its galaxy) loaded for the lifetime of `scope`
    /// and block until it is generated.
    pub fn load_system(
        &mut self,
        scope: &mut TicketScope,
        id: SystemId,
    ) -> Result<Arc<StarSystem>, StreamError> {
        let galaxy = self.load_galaxy(scope, id.galaxy)?;
        galaxy.with_sectors(|sectors| {
            let ticket = sectors.create_child_ticket(scope, Some(id.system));
            sectors.force_load_child(&ticket)
        })
    }

    /// Galaxies of a completed universe cell.
    pub fn cell(&self, coord: cosmos_common::CellCoord) -> Option<Arc<Payload<GalaxyInfo>>> {
        self.sectors.get_completed(coord)
    }

    pub fn galaxy(&self, id: ChildId) -> Option<Arc<Galaxy>> {
        self.sectors.get_child(id)
    }

    pub fn system(&self, id: SystemId) -> Option<Arc<StarSystem>> {
        self.galaxy(id.galaxy)?
            .with_sectors(|sectors| sectors.get_child(id.system))
    }

    pub fn tick(&mut self) {
        let _span = tracing::info_span!("universe_tick").entered();
        self.sectors.tick();
    }
}
