//! Error types for the persistence layer.

use strata_common::ChunkCoord;
use thiserror::Error;

use crate::codec::CodecError;
use crate::region::RegionError;

/// Errors raised while persisting or loading chunks.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Region file layer failure
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    /// Chunk record encoding/decoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// IO errors outside the region layer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No output destination could be opened for a chunk
    #[error("Unable to open region file for chunk {coord} in world '{world}'")]
    DestinationUnavailable {
        /// World name
        world: String,
        /// Chunk coordinate
        coord: ChunkCoord,
    },

    /// A save task panicked while writing
    #[error("Save task panicked for chunk {coord} in world '{world}': {message}")]
    TaskPanicked {
        /// World name
        world: String,
        /// Chunk coordinate
        coord: ChunkCoord,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Configuration could not be parsed or written
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;
