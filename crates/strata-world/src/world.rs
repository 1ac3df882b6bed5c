//! Worlds and the registry of known worlds.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use strata_common::{BlockCoord, ChunkCoord, WorldError, WorldId};
use tracing::{debug, info};

use crate::chunk::Chunk;
use crate::codec;
use crate::config::PersistenceConfig;
use crate::error::PersistenceResult;
use crate::region_manager::{ChunkOutputStream, RegionFileManager};
use crate::snapshot::{ChunkSnapshot, DynamicBlockUpdate, DynamicUpdates};

/// A loaded world: live chunks, pending dynamic updates, and region storage.
#[derive(Debug)]
pub struct World {
    id: WorldId,
    name: String,
    chunks: DashMap<ChunkCoord, Arc<Chunk>>,
    dynamic_updates: DynamicUpdates,
    regions: RegionFileManager,
    compress_chunks: bool,
}

impl World {
    /// Opens a world stored under `config.save_dir/<name>` and starts its
    /// region idle-timeout thread.
    pub fn open(
        name: impl Into<String>,
        config: &PersistenceConfig,
    ) -> PersistenceResult<Arc<Self>> {
        let name = name.into();
        let regions = RegionFileManager::new(config.region_dir(&name), config);
        regions.start_timeout_thread(&name)?;
        info!("Opened world '{name}' at {}", regions.base_path().display());

        Ok(Arc::new(Self {
            id: WorldId::next(),
            name,
            chunks: DashMap::new(),
            dynamic_updates: DynamicUpdates::new(),
            regions,
            compress_chunks: config.compress_chunks,
        }))
    }

    /// World id.
    #[must_use]
    pub const fn id(&self) -> WorldId {
        self.id
    }

    /// World name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether chunk bodies are compressed on save.
    #[must_use]
    pub const fn compress_chunks(&self) -> bool {
        self.compress_chunks
    }

    /// The world's region file manager.
    #[must_use]
    pub fn region_file_manager(&self) -> &RegionFileManager {
        &self.regions
    }

    /// Pending dynamic block updates.
    #[must_use]
    pub fn dynamic_updates(&self) -> &DynamicUpdates {
        &self.dynamic_updates
    }

    /// Schedules a dynamic update for a block.
    pub fn schedule_update(&self, block: BlockCoord, next_tick: u64, data: i32) {
        self.dynamic_updates.schedule(block, next_tick, data);
    }

    /// Owned copy of a chunk's pending dynamic updates.
    #[must_use]
    pub fn dynamic_updates_for(&self, coord: ChunkCoord) -> Vec<DynamicBlockUpdate> {
        self.dynamic_updates.for_chunk(coord)
    }

    /// Returns a loaded chunk.
    #[must_use]
    pub fn chunk(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.chunks.get(&coord).map(|c| Arc::clone(c.value()))
    }

    /// Returns a loaded chunk or an error naming it.
    pub fn require_chunk(&self, coord: ChunkCoord) -> Result<Arc<Chunk>, WorldError> {
        self.chunk(coord).ok_or(WorldError::ChunkNotLoaded {
            x: coord.x,
            y: coord.y,
            z: coord.z,
        })
    }

    /// Returns the chunk at `coord`, loading it from disk or creating it empty.
    pub fn get_or_load_chunk(&self, coord: ChunkCoord) -> PersistenceResult<Arc<Chunk>> {
        if let Some(chunk) = self.chunk(coord) {
            return Ok(chunk);
        }

        let chunk = self
            .load_from_disk(coord)?
            .unwrap_or_else(|| Chunk::new(self.id, coord));
        let chunk = self
            .chunks
            .entry(coord)
            .or_insert_with(|| Arc::new(chunk))
            .value()
            .clone();
        Ok(chunk)
    }

    fn load_from_disk(&self, coord: ChunkCoord) -> PersistenceResult<Option<Chunk>> {
        let Some(bytes) = self.regions.read_chunk(coord)? else {
            return Ok(None);
        };
        let record = codec::read_chunk(&bytes)?;
        self.dynamic_updates.restore(coord, record.updates);
        debug!("Loaded chunk {coord} of world '{}'", self.name);
        Ok(Some(Chunk::from_snapshot(self.id, record.snapshot)))
    }

    /// Removes a chunk from memory, returning it.
    pub fn unload_chunk(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.chunks.remove(&coord).map(|(_, chunk)| chunk)
    }

    /// Number of loaded chunks.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.chunks.len()
    }

    /// Loaded chunks with unsaved changes.
    #[must_use]
    pub fn dirty_chunks(&self) -> Vec<Arc<Chunk>> {
        let mut dirty: Vec<Arc<Chunk>> = self
            .chunks
            .iter()
            .filter(|c| c.value().needs_save())
            .map(|c| Arc::clone(c.value()))
            .collect();
        dirty.sort_by_key(|c| c.coord());
        dirty
    }

    /// Snapshot and deferred updates of a chunk, captured together.
    #[must_use]
    pub fn capture(&self, chunk: &Chunk) -> (ChunkSnapshot, Vec<DynamicBlockUpdate>) {
        (
            chunk.snapshot(&self.name),
            self.dynamic_updates_for(chunk.coord()),
        )
    }

    /// Opens a destination for a snapshot.
    #[must_use]
    pub fn chunk_output_stream(&self, snapshot: &ChunkSnapshot) -> Option<ChunkOutputStream> {
        self.regions.get_output_stream_for(snapshot)
    }

    /// Reads back the stored record of a chunk.
    pub fn read_stored_chunk(
        &self,
        coord: ChunkCoord,
    ) -> PersistenceResult<Option<codec::ChunkRecord>> {
        match self.regions.read_chunk(coord)? {
            Some(bytes) => Ok(Some(codec::read_chunk(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// The set of worlds known to the engine.
#[derive(Debug, Default)]
pub struct WorldRegistry {
    worlds: RwLock<Vec<Arc<World>>>,
}

impl WorldRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a world. Names must be unique.
    pub fn register(&self, world: Arc<World>) -> Result<(), WorldError> {
        let mut worlds = self.worlds.write();
        if worlds.iter().any(|w| w.name() == world.name()) {
            return Err(WorldError::DuplicateWorld(world.name().to_string()));
        }
        worlds.push(world);
        Ok(())
    }

    /// Looks up a world by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<World>> {
        self.worlds.read().iter().find(|w| w.name() == name).cloned()
    }

    /// All registered worlds, in registration order.
    #[must_use]
    pub fn worlds(&self) -> Vec<Arc<World>> {
        self.worlds.read().clone()
    }

    /// Number of registered worlds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.worlds.read().len()
    }

    /// Returns true if no world is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.worlds.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::BlockState;
    use std::io::Write;
    use strata_common::LocalCoord;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str) -> Arc<World> {
        World::open(name, &PersistenceConfig::with_save_dir(dir.path())).expect("open world")
    }

    #[test]
    fn test_get_or_load_creates_empty_chunk() {
        let dir = TempDir::new().expect("temp dir");
        let world = open(&dir, "overworld");
        let coord = ChunkCoord::new(1, 1, 1);

        let chunk = world.get_or_load_chunk(coord).expect("chunk");
        assert_eq!(chunk.coord(), coord);
        assert_eq!(world.loaded_count(), 1);
        assert!(Arc::ptr_eq(&chunk, &world.get_or_load_chunk(coord).expect("again")));
    }

    #[test]
    fn test_saved_chunk_loads_back_with_updates() {
        let dir = TempDir::new().expect("temp dir");
        let world = open(&dir, "overworld");
        let coord = ChunkCoord::new(0, 0, 0);
        let chunk = world.get_or_load_chunk(coord).expect("chunk");
        chunk.set_block(LocalCoord::new(2, 2, 2), BlockState::new(8, 0));
        world.schedule_update(BlockCoord::new(2, 2, 2), 99, 4);

        let (snapshot, updates) = world.capture(&chunk);
        let mut out = world.chunk_output_stream(&snapshot).expect("destination");
        codec::write_chunk(&mut out, &snapshot, &updates, world.compress_chunks())
            .expect("encode");
        out.flush().expect("flush");
        out.finish().expect("commit");

        world.unload_chunk(coord);
        world.dynamic_updates().restore(coord, Vec::new());

        let loaded = world.get_or_load_chunk(coord).expect("reload");
        assert_eq!(loaded.block(LocalCoord::new(2, 2, 2)), Some(BlockState::new(8, 0)));
        assert!(!loaded.needs_save());
        assert_eq!(world.dynamic_updates_for(coord).len(), 1);
    }

    #[test]
    fn test_dirty_chunks_sorted() {
        let dir = TempDir::new().expect("temp dir");
        let world = open(&dir, "overworld");
        for x in [3, 1, 2] {
            world
                .get_or_load_chunk(ChunkCoord::new(x, 0, 0))
                .expect("chunk")
                .mark_dirty();
        }
        world.get_or_load_chunk(ChunkCoord::new(9, 0, 0)).expect("clean");

        let coords: Vec<i32> = world.dirty_chunks().iter().map(|c| c.coord().x).collect();
        assert_eq!(coords, vec![1, 2, 3]);
    }

    #[test]
    fn test_require_chunk_error() {
        let dir = TempDir::new().expect("temp dir");
        let world = open(&dir, "overworld");
        assert!(matches!(
            world.require_chunk(ChunkCoord::new(4, 5, 6)),
            Err(WorldError::ChunkNotLoaded { x: 4, y: 5, z: 6 })
        ));
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let dir = TempDir::new().expect("temp dir");
        let registry = WorldRegistry::new();
        registry.register(open(&dir, "a")).expect("first");
        registry.register(open(&dir, "b")).expect("second");
        assert!(registry.register(open(&dir, "a")).is_err());

        assert_eq!(registry.len(), 2);
        assert!(registry.get("b").is_some());
        let names: Vec<String> = registry
            .worlds()
            .iter()
            .map(|w| w.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
