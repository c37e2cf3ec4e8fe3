//! # Regio Utils
//!
//! Small shared types used across the regio crates: world coordinates and lock aliases.
pub mod locks;
pub mod math;
mod types;

pub use types::{ChunkPos, RegionSectionPos};
