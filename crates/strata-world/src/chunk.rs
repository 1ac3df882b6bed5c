//! Live chunk state.
//!
//! A [`Chunk`] is mutated by the simulation while the save pipeline reads
//! point-in-time copies of it. Every mutation bumps a revision counter under
//! the same write lock, so a snapshot and its revision always agree.

use bytemuck::{Pod, Zeroable};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use strata_common::{ChunkCoord, EntityId, LocalCoord, WorldId, CHUNK_VOLUME};

use crate::snapshot::ChunkSnapshot;

/// A single block: material id plus per-block data bits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable,
)]
#[repr(C)]
pub struct BlockState {
    /// Material id (0 = air)
    pub id: u16,
    /// Material-specific data
    pub data: u16,
}

impl BlockState {
    /// Empty block.
    pub const AIR: Self = Self { id: 0, data: 0 };

    /// Creates a block state.
    #[must_use]
    pub const fn new(id: u16, data: u16) -> Self {
        Self { id, data }
    }

    /// Returns true for air.
    #[must_use]
    pub const fn is_air(self) -> bool {
        self.id == 0
    }
}

/// Entity stored inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity id
    pub id: EntityId,
    /// Entity type name
    pub kind: String,
    /// Position in block space
    pub position: [f32; 3],
}

/// Mutable contents guarded by the chunk lock.
#[derive(Debug, Clone)]
struct ChunkContents {
    blocks: Vec<BlockState>,
    entities: Vec<EntityRecord>,
    data: BTreeMap<String, Vec<u8>>,
    revision: u64,
}

/// Save bookkeeping for a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveState {
    /// Highest revision known to be durably written
    pub saved_revision: u64,
    /// Time of the most recent successful save
    pub last_saved: Option<SystemTime>,
}

/// A live chunk owned by a world.
#[derive(Debug)]
pub struct Chunk {
    world: WorldId,
    coord: ChunkCoord,
    contents: RwLock<ChunkContents>,
    save: Mutex<SaveState>,
}

impl Chunk {
    /// Creates an empty (all air) chunk.
    #[must_use]
    pub fn new(world: WorldId, coord: ChunkCoord) -> Self {
        Self {
            world,
            coord,
            contents: RwLock::new(ChunkContents {
                blocks: vec![BlockState::AIR; CHUNK_VOLUME],
                entities: Vec::new(),
                data: BTreeMap::new(),
                revision: 0,
            }),
            save: Mutex::new(SaveState::default()),
        }
    }

    /// Rebuilds a chunk from a stored snapshot. The result counts as saved.
    #[must_use]
    pub fn from_snapshot(world: WorldId, snapshot: ChunkSnapshot) -> Self {
        let revision = snapshot.revision();
        let coord = snapshot.coord();
        let (mut blocks, entities, data) = snapshot.into_parts();
        blocks.resize(CHUNK_VOLUME, BlockState::AIR);
        Self {
            world,
            coord,
            contents: RwLock::new(ChunkContents {
                blocks,
                entities,
                data,
                revision,
            }),
            save: Mutex::new(SaveState {
                saved_revision: revision,
                last_saved: None,
            }),
        }
    }

    /// Returns the owning world id.
    #[must_use]
    pub const fn world(&self) -> WorldId {
        self.world
    }

    /// Returns the chunk coordinate.
    #[must_use]
    pub const fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// Current revision; bumped by every mutation.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.contents.read().revision
    }

    /// Gets a block at local coordinates.
    #[must_use]
    pub fn block(&self, local: LocalCoord) -> Option<BlockState> {
        if !local.is_valid() {
            return None;
        }
        self.contents.read().blocks.get(local.to_index()).copied()
    }

    /// Sets a block at local coordinates.
    pub fn set_block(&self, local: LocalCoord, block: BlockState) -> bool {
        if !local.is_valid() {
            return false;
        }
        let mut contents = self.contents.write();
        match contents.blocks.get_mut(local.to_index()) {
            Some(slot) => {
                *slot = block;
                contents.revision += 1;
                true
            },
            None => false,
        }
    }

    /// Fills the whole chunk with one block.
    pub fn fill(&self, block: BlockState) {
        let mut contents = self.contents.write();
        contents.blocks.fill(block);
        contents.revision += 1;
    }

    /// Adds an entity to the chunk.
    pub fn add_entity(&self, entity: EntityRecord) {
        let mut contents = self.contents.write();
        contents.entities.push(entity);
        contents.revision += 1;
    }

    /// Removes an entity, returning it if present.
    pub fn remove_entity(&self, id: EntityId) -> Option<EntityRecord> {
        let mut contents = self.contents.write();
        let index = contents.entities.iter().position(|e| e.id == id)?;
        contents.revision += 1;
        Some(contents.entities.remove(index))
    }

    /// Number of entities in the chunk.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.contents.read().entities.len()
    }

    /// Stores an auxiliary data entry.
    pub fn set_data(&self, key: impl Into<String>, value: Vec<u8>) {
        let mut contents = self.contents.write();
        contents.data.insert(key.into(), value);
        contents.revision += 1;
    }

    /// Reads an auxiliary data entry.
    #[must_use]
    pub fn data(&self, key: &str) -> Option<Vec<u8>> {
        self.contents.read().data.get(key).cloned()
    }

    /// Forces the chunk to count as modified.
    pub fn mark_dirty(&self) {
        self.contents.write().revision += 1;
    }

    /// Takes an immutable copy of the current contents.
    ///
    /// Runs under the read lock, so no mutation can be half-applied in the
    /// result.
    #[must_use]
    pub fn snapshot(&self, world_name: &str) -> ChunkSnapshot {
        let contents = self.contents.read();
        ChunkSnapshot::new(
            self.world,
            world_name.to_string(),
            self.coord,
            contents.revision,
            contents.blocks.clone(),
            contents.entities.clone(),
            contents.data.clone(),
        )
    }

    /// Records that `revision` has been written durably.
    ///
    /// Never moves the saved revision backwards.
    pub fn save_complete(&self, revision: u64) {
        let mut save = self.save.lock();
        save.saved_revision = save.saved_revision.max(revision);
        save.last_saved = Some(SystemTime::now());
    }

    /// Returns the save bookkeeping.
    #[must_use]
    pub fn save_state(&self) -> SaveState {
        *self.save.lock()
    }

    /// Returns whether the chunk has changes that are not on disk.
    #[must_use]
    pub fn needs_save(&self) -> bool {
        self.revision() > self.save.lock().saved_revision
    }
}
