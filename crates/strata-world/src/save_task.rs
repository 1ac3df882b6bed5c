//! One chunk write: snapshot, deferred updates, and the chunk to mark saved.

use std::sync::Arc;
use strata_common::ChunkCoord;

use crate::chunk::Chunk;
use crate::codec;
use crate::error::{PersistenceError, PersistenceResult};
use crate::snapshot::{ChunkSnapshot, DynamicBlockUpdate};
use crate::world::World;

/// A captured chunk waiting to be written.
///
/// The snapshot and update list are copied when the task is built and are
/// never touched by anything but [`SaveTask::execute`].
#[derive(Debug)]
pub struct SaveTask {
    snapshot: ChunkSnapshot,
    updates: Vec<DynamicBlockUpdate>,
    chunk: Arc<Chunk>,
    world: Arc<World>,
}

/// Details of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Chunk written
    pub coord: ChunkCoord,
    /// Revision now on disk
    pub revision: u64,
    /// Encoded size in bytes
    pub bytes: usize,
}

impl SaveTask {
    /// Captures the chunk's current state on the calling thread.
    #[must_use]
    pub fn capture(world: &Arc<World>, chunk: &Arc<Chunk>) -> Self {
        let (snapshot, updates) = world.capture(chunk);
        Self {
            snapshot,
            updates,
            chunk: Arc::clone(chunk),
            world: Arc::clone(world),
        }
    }

    /// Snapshot this task will write.
    #[must_use]
    pub fn snapshot(&self) -> &ChunkSnapshot {
        &self.snapshot
    }

    /// Deferred updates written alongside the snapshot.
    #[must_use]
    pub fn updates(&self) -> &[DynamicBlockUpdate] {
        &self.updates
    }

    /// Chunk coordinate.
    #[must_use]
    pub fn coord(&self) -> ChunkCoord {
        self.snapshot.coord()
    }

    /// Owning world.
    #[must_use]
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Writes the snapshot and marks the chunk saved.
    ///
    /// The chunk's save state is only touched after the region commit
    /// succeeds, so a failed write leaves it eligible for another attempt.
    pub fn execute(&self) -> PersistenceResult<SaveOutcome> {
        let Some(mut out) = self.world.chunk_output_stream(&self.snapshot) else {
            return Err(PersistenceError::DestinationUnavailable {
                world: self.world.name().to_string(),
                coord: self.coord(),
            });
        };

        let bytes = codec::write_chunk(
            &mut out,
            &self.snapshot,
            &self.updates,
            self.world.compress_chunks(),
        )?;
        out.finish()?;

        self.chunk.save_complete(self.snapshot.revision());
        Ok(SaveOutcome {
            coord: self.coord(),
            revision: self.snapshot.revision(),
            bytes,
        })
    }
}
