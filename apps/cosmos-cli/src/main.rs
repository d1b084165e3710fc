use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cosmos_common::CellCoord;
use cosmos_octree::ElementId;
use cosmos_stream::{ChildId, RegionOfInterest, TickHistory, TicketScope};
use cosmos_universe::{SystemId, Universe, UniverseConfig};
use glam::DVec3;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cosmos-cli", about = "CLI tool for streaming a procedural universe")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Universe config file (JSON); defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Fly a viewer through the universe and report streaming stats
    Stream {
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "100")]
        ticks: u64,
        /// Region-of-interest radius, in universe cells
        #[arg(short, long, default_value = "2.0")]
        radius: f64,
        /// Viewer speed, in universe cells per tick
        #[arg(long, default_value = "0.1")]
        speed: f64,
        /// Coarsest level kept around the viewer (0 streams only the finest cells)
        #[arg(short, long, default_value = "0")]
        levels: u8,
        /// Override the configured seed
        #[arg(short, long)]
        seed: Option<u64>,
    },
    /// List the galaxies of one universe cell
    Cell {
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
        #[arg(allow_hyphen_values = true)]
        z: i32,
    },
    /// Expand one galaxy and describe its central sector
    Galaxy {
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
        #[arg(allow_hyphen_values = true)]
        z: i32,
        /// Galaxy index within the cell
        #[arg(short, long, default_value = "0")]
        index: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => UniverseConfig::load(path)?,
        None => UniverseConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("cosmos-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("stream: {}", cosmos_stream::crate_info());
            println!("universe: {}", cosmos_universe::crate_info());
            println!(
                "config: seed={}, async={}, threads={}",
                config.stream.seed,
                config.stream.async_generation,
                config.stream.worker_threads
            );
        }
        Commands::Stream {
            ticks,
            radius,
            speed,
            levels,
            seed,
        } => {
            let mut config = config;
            if let Some(seed) = seed {
                config.stream.seed = seed;
            }
            println!(
                "Streaming: seed={}, ticks={ticks}, radius={radius}, speed={speed}, levels={levels}",
                config.stream.seed
            );
            stream(config, ticks, radius, speed, levels)?;
        }
        Commands::Cell { x, y, z } => {
            let mut universe = Universe::new(config)?;
            let coord = CellCoord::new(x, y, z);
            let mut scope = TicketScope::new();
            let ticket = universe
                .sectors_mut()
                .create_ticket(&mut scope, RegionOfInterest::single(coord));
            let loaded = universe.sectors_mut().force_load(&ticket)?;

            for (coord, payload) in &loaded {
                println!("Cell {coord}: {} galaxies", payload.len());
                for galaxy in payload.elements().iter() {
                    let p = galaxy.position;
                    println!(
                        "  [{}] {} at ({:.3}, {:.3}, {:.3}), age={:.0} Myr",
                        galaxy.id, galaxy.value.kind, p.x, p.y, p.z, galaxy.value.age_myr
                    );
                }
            }
        }
        Commands::Galaxy { x, y, z, index } => {
            let mut universe = Universe::new(config)?;
            let id = ChildId::new(CellCoord::new(x, y, z), ElementId(index));
            let mut scope = TicketScope::new();
            let galaxy = universe.load_galaxy(&mut scope, id)?;
            println!(
                "Galaxy {id}: {} galaxy, age={:.0} Myr",
                galaxy.info.kind, galaxy.info.age_myr
            );

            let center = CellCoord::new(0, 0, 0);
            let sector = galaxy.with_sectors(|sectors| {
                let ticket = sectors.create_ticket(&mut scope, RegionOfInterest::single(center));
                sectors.force_load_cell(&ticket, center)
            })?;
            let stats = sector.elements().stats();
            println!(
                "Central sector: {} stars (octree: {} branches, {} leaves, depth {})",
                sector.len(),
                stats.branches,
                stats.leaves,
                stats.depth
            );

            let Some(star) = sector.elements().nearest_in_radius(DVec3::ZERO, 1.0) else {
                println!("No star near the galactic centre");
                return Ok(());
            };
            let system_id = SystemId {
                galaxy: id,
                system: ChildId::new(center, star.id),
            };
            let system = universe.load_system(&mut scope, system_id)?;
            println!(
                "System {system_id}: {:.2} Msol, {:.0} K, {} bodies",
                system.star.mass_msol,
                system.star.temperature_k,
                system.bodies.len()
            );
            for body in &system.bodies {
                println!(
                    "  {} {:?}: {:.2} AU, {:.2} Mearth",
                    body.name, body.kind, body.orbit_radius_au, body.mass_earth
                );
            }
        }
    }

    Ok(())
}

fn stream(
    config: UniverseConfig,
    ticks: u64,
    radius: f64,
    speed: f64,
    levels: u8,
) -> anyhow::Result<()> {
    let mut universe = Universe::new(config)?;
    let mut scope = TicketScope::new();
    let viewer = universe
        .sectors_mut()
        .create_ticket(&mut scope, RegionOfInterest::lod(DVec3::ZERO, radius, levels));

    let mut history = TickHistory::new(120);
    for i in 0..ticks {
        // Drift along a shallow diagonal
        let center = DVec3::new(1.0, 0.25, 0.0) * (i as f64 * speed);
        viewer.set_roi(RegionOfInterest::lod(center, radius, levels));
        universe.tick();
        history.record(universe.stats());
    }

    let sectors = universe.sectors_mut();
    let visible = sectors.force_load(&viewer)?;
    let galaxies: usize = visible.values().map(|p| p.len()).sum();
    let stats = sectors.stats();
    println!(
        "Visible: {} cells, {galaxies} galaxies (ticket complete: {})",
        visible.len(),
        sectors.is_ticket_complete(&viewer)
    );
    println!(
        "Cells: total={}, complete={}, pending={}",
        stats.total_cells, stats.complete_cells, stats.pending_cells
    );
    println!(
        "Work: loaded={}, evicted={}, spawned={}, discarded={}, failures={}",
        stats.cells_loaded,
        stats.cells_evicted,
        stats.tasks_spawned,
        stats.tasks_discarded,
        stats.generation_failures
    );
    println!(
        "Last {} ticks: avg={:?}, slowest={:?}, churn={} cells, peak spawn={}",
        history.count(),
        history.average_tick(),
        history.slowest_tick(),
        history.churn(),
        history.peak_spawned()
    );

    scope.close();
    universe.tick();
    println!("After release: {} cells", universe.stats().total_cells);
    Ok(())
}
