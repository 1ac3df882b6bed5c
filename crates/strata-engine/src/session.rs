//! A simulated play session exercising the save pipeline end to end.

use anyhow::{Context, Result};
use std::sync::Arc;
use strata_common::{BlockCoord, ChunkCoord, EntityId, LocalCoord, CHUNK_VOLUME};
use strata_world::{
    BlockState, EntityRecord, PersistenceConfig, SaverStats, World, WorldRegistry, WorldSaver,
    WorkerState,
};
use tracing::info;

/// Shape of the simulated session.
#[derive(Debug, Clone, Copy)]
pub struct SessionPlan {
    /// Chunks per axis of the loaded cube
    pub radius: i32,
    /// Simulation ticks
    pub ticks: u64,
    /// Ticks between save sweeps
    pub save_interval: u64,
}

impl Default for SessionPlan {
    fn default() -> Self {
        Self {
            radius: 2,
            ticks: 40,
            save_interval: 10,
        }
    }
}

/// What a session did.
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    /// Final saver counters
    pub stats: SaverStats,
    /// Save requests issued by sweeps
    pub requested: usize,
    /// Worker state after shutdown
    pub final_state: WorkerState,
}

/// Runs a session against the worlds stored under `config.save_dir`.
pub fn run(config: &PersistenceConfig, plan: SessionPlan) -> Result<SessionReport> {
    let registry = Arc::new(WorldRegistry::new());
    let world = World::open("overworld", config).context("opening overworld")?;
    registry.register(Arc::clone(&world))?;

    let saver = WorldSaver::new(Arc::clone(&registry), config);
    saver.start().context("starting world saving thread")?;

    let coords: Vec<ChunkCoord> = (0..plan.radius)
        .flat_map(|x| {
            (0..plan.radius)
                .flat_map(move |y| (0..plan.radius).map(move |z| ChunkCoord::new(x, y, z)))
        })
        .collect();
    for coord in &coords {
        world.get_or_load_chunk(*coord)?;
    }
    info!("Loaded {} chunks", world.loaded_count());

    let mut requested = 0;
    for tick in 0..plan.ticks {
        simulate_tick(&world, &coords, tick)?;
        if plan.save_interval > 0 && tick % plan.save_interval == 0 {
            requested += saver.save_dirty(&world);
        }
    }

    requested += saver.save_dirty(&world);
    saver.signal_stop();
    saver.await_termination();

    Ok(SessionReport {
        stats: saver.stats(),
        requested,
        final_state: saver.state(),
    })
}

fn simulate_tick(world: &World, coords: &[ChunkCoord], tick: u64) -> Result<()> {
    // Falling blocks land and clear their cell.
    for (coord, update) in world.dynamic_updates().take_due(tick) {
        if let Some(chunk) = world.chunk(coord) {
            chunk.set_block(update.local(), BlockState::AIR);
        }
    }

    if coords.is_empty() {
        return Ok(());
    }
    let coord = coords[(tick as usize) % coords.len()];
    let chunk = world.require_chunk(coord)?;

    let local = LocalCoord::from_index((tick as usize * 97) % CHUNK_VOLUME);
    chunk.set_block(local, BlockState::new((tick % 7) as u16 + 1, 0));

    if tick % 5 == 0 {
        chunk.add_entity(EntityRecord {
            id: EntityId::new(),
            kind: "falling_block".to_string(),
            position: [f32::from(local.x), f32::from(local.y), f32::from(local.z)],
        });
        let origin = coord.to_block_coord();
        world.schedule_update(
            BlockCoord::new(
                origin.x + i32::from(local.x),
                origin.y + i32::from(local.y),
                origin.z + i32::from(local.z),
            ),
            tick + 20,
            1,
        );
    }
    Ok(())
}
