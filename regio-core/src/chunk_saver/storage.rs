//! Chunk storage abstraction.
//!
//! [`ChunkStorage`] is either the built in in-memory store or an external backend behind the
//! [`ChunkIo`] trait (region files, a database, a remote service).

use std::sync::Arc;

use futures::future::BoxFuture;
use regio_utils::ChunkPos;

use crate::chunk::ChunkData;
use crate::error::ChunkIoError;

use super::ram_only::RamOnlyStorage;

/// A pluggable persistence backend.
///
/// Every method returns a boxed future that runs on the chunk I/O runtime.
pub trait ChunkIo: Send + Sync + 'static {
    /// Reads a column. `Ok(None)` means it was never saved and must be generated.
    fn load_chunk(
        &self,
        pos: ChunkPos,
    ) -> BoxFuture<'static, Result<Option<ChunkData>, ChunkIoError>>;

    /// Writes a column.
    fn save_chunk(&self, data: ChunkData) -> BoxFuture<'static, Result<(), ChunkIoError>>;

    /// Flushes buffered writes and releases handles. Called once during shutdown.
    fn close_all(&self) -> BoxFuture<'static, Result<(), ChunkIoError>>;
}

/// Chunk storage backend.
pub enum ChunkStorage {
    /// In-memory storage for testing and minigames.
    RamOnly(RamOnlyStorage),
    /// Any other backend.
    External(Arc<dyn ChunkIo>),
}

impl ChunkStorage {
    /// Loads a chunk from storage.
    ///
    /// Returns `Ok(None)` if the chunk doesn't exist in storage.
    pub async fn load_chunk(&self, pos: ChunkPos) -> Result<Option<ChunkData>, ChunkIoError> {
        match self {
            Self::RamOnly(ram) => Ok(ram.load_chunk(pos).await),
            Self::External(io) => io.load_chunk(pos).await,
        }
    }

    /// Saves a chunk to storage.
    pub async fn save_chunk(&self, data: ChunkData) -> Result<(), ChunkIoError> {
        match self {
            Self::RamOnly(ram) => {
                ram.save_chunk(data).await;
                Ok(())
            }
            Self::External(io) => io.save_chunk(data).await,
        }
    }

    /// Closes all storage handles and flushes pending data.
    pub async fn close_all(&self) -> Result<(), ChunkIoError> {
        match self {
            Self::RamOnly(_) => Ok(()), // Nothing is buffered
            Self::External(io) => io.close_all().await,
        }
    }
}

impl From<RamOnlyStorage> for ChunkStorage {
    fn from(storage: RamOnlyStorage) -> Self {
        Self::RamOnly(storage)
    }
}
