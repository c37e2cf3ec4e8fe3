//! This module contains the `ChunkGenerator` trait, used when storage has no copy of a column.

use regio_utils::ChunkPos;

use crate::chunk::ChunkData;
use crate::error::ChunkIoError;

/// Produces fresh columns.
///
/// Generation runs on the blocking pool of the chunk I/O runtime, so implementations may take
/// their time. An error is treated like a storage error of the same kind.
pub trait ChunkGenerator: Send + Sync + 'static {
    /// Generates the column at `pos`.
    fn generate(&self, pos: ChunkPos) -> Result<ChunkData, ChunkIoError>;
}

/// A chunk generator that generates a flat world.
///
/// The payload is the layer list, bottom first, one byte per block state.
pub struct FlatChunkGenerator {
    layers: Vec<u8>,
}

impl FlatChunkGenerator {
    /// Bedrock
    pub const BEDROCK: u8 = 1;
    /// Dirt
    pub const DIRT: u8 = 2;
    /// Grass block
    pub const GRASS: u8 = 3;

    /// Creates a generator with the given layers, bottom first.
    #[must_use]
    pub const fn new(layers: Vec<u8>) -> Self {
        Self { layers }
    }
}

impl Default for FlatChunkGenerator {
    fn default() -> Self {
        Self::new(vec![Self::BEDROCK, Self::DIRT, Self::DIRT, Self::GRASS])
    }
}

impl ChunkGenerator for FlatChunkGenerator {
    fn generate(&self, pos: ChunkPos) -> Result<ChunkData, ChunkIoError> {
        let mut data = ChunkData::empty(pos);
        data.payload.clone_from(&self.layers);
        Ok(data)
    }
}
