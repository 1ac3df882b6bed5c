//! Coordinate types for block, chunk, and chunk-local positions.
//!
//! Chunks are cubes of [`CHUNK_SIZE`] blocks per axis. Conversions use
//! euclidean division so negative coordinates land in the correct chunk.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Blocks per chunk along each axis.
pub const CHUNK_SIZE: u32 = 16;

/// Total blocks in a chunk.
pub const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Absolute block position in a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct BlockCoord {
    /// X coordinate in block space
    pub x: i32,
    /// Y coordinate in block space
    pub y: i32,
    /// Z coordinate in block space
    pub z: i32,
}

impl BlockCoord {
    /// Creates a new block coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the chunk containing this block.
    #[must_use]
    pub const fn to_chunk_coord(self) -> ChunkCoord {
        let size = CHUNK_SIZE as i32;
        ChunkCoord {
            x: self.x.div_euclid(size),
            y: self.y.div_euclid(size),
            z: self.z.div_euclid(size),
        }
    }

    /// Returns the position of this block inside its chunk.
    #[must_use]
    pub const fn to_local_coord(self) -> LocalCoord {
        let size = CHUNK_SIZE as i32;
        LocalCoord {
            x: self.x.rem_euclid(size) as u8,
            y: self.y.rem_euclid(size) as u8,
            z: self.z.rem_euclid(size) as u8,
        }
    }
}

/// Chunk coordinate (identifies a chunk in the world grid).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Pod,
    Zeroable,
)]
#[repr(C)]
pub struct ChunkCoord {
    /// X coordinate in chunk space
    pub x: i32,
    /// Y coordinate in chunk space
    pub y: i32,
    /// Z coordinate in chunk space
    pub z: i32,
}

impl ChunkCoord {
    /// Creates a new chunk coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the block at the minimum corner of this chunk.
    #[must_use]
    pub const fn to_block_coord(self) -> BlockCoord {
        let size = CHUNK_SIZE as i32;
        BlockCoord {
            x: self.x * size,
            y: self.y * size,
            z: self.z * size,
        }
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Block position inside a chunk (0 to CHUNK_SIZE-1 on each axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalCoord {
    /// X coordinate within chunk
    pub x: u8,
    /// Y coordinate within chunk
    pub y: u8,
    /// Z coordinate within chunk
    pub z: u8,
}

impl LocalCoord {
    /// Creates a new local coordinate.
    #[must_use]
    pub const fn new(x: u8, y: u8, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Returns true if every axis lies inside a chunk.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        (self.x as u32) < CHUNK_SIZE && (self.y as u32) < CHUNK_SIZE && (self.z as u32) < CHUNK_SIZE
    }

    /// Converts to linear index for array access (x fastest, then z, then y).
    #[must_use]
    pub const fn to_index(self) -> usize {
        let size = CHUNK_SIZE as usize;
        (self.y as usize * size + self.z as usize) * size + self.x as usize
    }

    /// Creates from linear index.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        let size = CHUNK_SIZE as usize;
        Self {
            x: (index % size) as u8,
            z: ((index / size) % size) as u8,
            y: (index / (size * size)) as u8,
        }
    }

    /// Packs the position into 12 bits.
    #[must_use]
    pub const fn pack(self) -> u16 {
        self.to_index() as u16
    }

    /// Unpacks a position produced by [`LocalCoord::pack`].
    #[must_use]
    pub const fn unpack(packed: u16) -> Self {
        Self::from_index(packed as usize % CHUNK_VOLUME)
    }
}
