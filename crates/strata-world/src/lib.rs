//! # Strata World
//!
//! World management and chunk persistence for strata.
//!
//! This crate handles:
//! - Live chunks and immutable snapshots of them
//! - Deferred block updates stored with their chunk
//! - Region files and their per-world manager
//! - The background save pipeline and its orderly shutdown

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod region;
pub mod region_manager;
pub mod save_queue;
pub mod save_task;
pub mod saver;
pub mod snapshot;
pub mod world;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::chunk::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::region_manager::{ChunkOutputStream, RegionFileManager, RegionStats};
    pub use crate::save_task::*;
    pub use crate::saver::*;
    pub use crate::snapshot::*;
    pub use crate::world::*;
}

pub use prelude::*;
