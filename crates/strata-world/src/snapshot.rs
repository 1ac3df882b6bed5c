//! Immutable chunk snapshots and deferred block updates.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use strata_common::{BlockCoord, ChunkCoord, LocalCoord, WorldId};

use crate::chunk::{BlockState, EntityRecord};

/// Point-in-time copy of a chunk.
///
/// Owns all of its data; nothing the live chunk does afterwards can reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    world: WorldId,
    world_name: String,
    coord: ChunkCoord,
    revision: u64,
    blocks: Vec<BlockState>,
    entities: Vec<EntityRecord>,
    data: BTreeMap<String, Vec<u8>>,
}

impl ChunkSnapshot {
    /// Assembles a snapshot from already-copied parts.
    #[must_use]
    pub fn new(
        world: WorldId,
        world_name: String,
        coord: ChunkCoord,
        revision: u64,
        blocks: Vec<BlockState>,
        entities: Vec<EntityRecord>,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            world,
            world_name,
            coord,
            revision,
            blocks,
            entities,
            data,
        }
    }

    /// Owning world id at capture time.
    #[must_use]
    pub const fn world(&self) -> WorldId {
        self.world
    }

    /// Owning world name.
    #[must_use]
    pub fn world_name(&self) -> &str {
        &self.world_name
    }

    /// Chunk coordinate.
    #[must_use]
    pub const fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// Revision of the live chunk when this was captured.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Block at local coordinates.
    #[must_use]
    pub fn block(&self, local: LocalCoord) -> Option<BlockState> {
        if !local.is_valid() {
            return None;
        }
        self.blocks.get(local.to_index()).copied()
    }

    /// All blocks in index order.
    #[must_use]
    pub fn blocks(&self) -> &[BlockState] {
        &self.blocks
    }

    /// Entities at capture time.
    #[must_use]
    pub fn entities(&self) -> &[EntityRecord] {
        &self.entities
    }

    /// Auxiliary data table.
    #[must_use]
    pub fn data(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Vec<BlockState>, Vec<EntityRecord>, BTreeMap<String, Vec<u8>>) {
        (self.blocks, self.entities, self.data)
    }
}

/// A delayed block effect that must survive a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynamicBlockUpdate {
    /// Block position inside the chunk, packed with [`LocalCoord::pack`]
    pub packed: u16,
    /// World tick at which the update fires
    pub next_tick: u64,
    /// Update-specific payload
    pub data: i32,
}

impl DynamicBlockUpdate {
    /// Creates an update for a block inside a chunk.
    #[must_use]
    pub const fn new(local: LocalCoord, next_tick: u64, data: i32) -> Self {
        Self {
            packed: local.pack(),
            next_tick,
            data,
        }
    }

    /// Block position inside the chunk.
    #[must_use]
    pub const fn local(&self) -> LocalCoord {
        LocalCoord::unpack(self.packed)
    }
}

/// Pending dynamic updates for one world, grouped by chunk.
#[derive(Debug, Default)]
pub struct DynamicUpdates {
    pending: Mutex<HashMap<ChunkCoord, Vec<DynamicBlockUpdate>>>,
}

impl DynamicUpdates {
    /// Creates an empty update store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an update for a block.
    pub fn schedule(&self, block: BlockCoord, next_tick: u64, data: i32) {
        let update = DynamicBlockUpdate::new(block.to_local_coord(), next_tick, data);
        self.pending
            .lock()
            .entry(block.to_chunk_coord())
            .or_default()
            .push(update);
    }

    /// Owned copy of the updates for a chunk, in scheduling order.
    #[must_use]
    pub fn for_chunk(&self, coord: ChunkCoord) -> Vec<DynamicBlockUpdate> {
        self.pending
            .lock()
            .get(&coord)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the updates of a chunk, typically after loading it.
    pub fn restore(&self, coord: ChunkCoord, updates: Vec<DynamicBlockUpdate>) {
        let mut pending = self.pending.lock();
        if updates.is_empty() {
            pending.remove(&coord);
        } else {
            pending.insert(coord, updates);
        }
    }

    /// Removes and returns every update due at or before `tick`.
    pub fn take_due(&self, tick: u64) -> Vec<(ChunkCoord, DynamicBlockUpdate)> {
        let mut due = Vec::new();
        let mut pending = self.pending.lock();
        pending.retain(|coord, updates| {
            updates.retain(|u| {
                if u.next_tick <= tick {
                    due.push((*coord, *u));
                    false
                } else {
                    true
                }
            });
            !updates.is_empty()
        });
        due.sort_by_key(|(_, u)| u.next_tick);
        due
    }

    /// Total number of pending updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Returns true when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
