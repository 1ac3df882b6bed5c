//! Error types shared across strata crates.

use thiserror::Error;

/// World and chunk errors.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Chunk not loaded
    #[error("Chunk not loaded at ({x}, {y}, {z})")]
    ChunkNotLoaded {
        /// X coordinate
        x: i32,
        /// Y coordinate
        y: i32,
        /// Z coordinate
        z: i32,
    },

    /// A world with the same name is already registered
    #[error("World already registered: {0}")]
    DuplicateWorld(String),
}
