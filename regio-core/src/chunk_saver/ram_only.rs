//! RAM-only chunk storage.
//!
//! Keeps saved columns in memory and never touches disk. Useful for:
//! - Tests
//! - Minigame worlds
//! - Temporary worlds that don't need persistence

use regio_utils::{ChunkPos, locks::AsyncRwLock};
use rustc_hash::FxHashMap;

use crate::chunk::ChunkData;

/// In-memory chunk storage.
///
/// Saved columns survive an unload and reload for as long as the storage lives, which is what
/// entity persistence across unloads needs.
pub struct RamOnlyStorage {
    saved_chunks: AsyncRwLock<FxHashMap<ChunkPos, ChunkData>>,
    /// If true, create empty chunks on first access instead of returning None.
    create_empty_on_miss: bool,
}

impl RamOnlyStorage {
    /// Creates a storage that returns empty chunks for columns it has never seen.
    ///
    /// Chunk generation is bypassed entirely.
    #[must_use]
    pub fn empty_world() -> Self {
        Self {
            saved_chunks: AsyncRwLock::new(FxHashMap::default()),
            create_empty_on_miss: true,
        }
    }

    /// Creates a storage that only returns previously saved chunks. Misses go to the generator.
    #[must_use]
    pub fn preloaded() -> Self {
        Self {
            saved_chunks: AsyncRwLock::new(FxHashMap::default()),
            create_empty_on_miss: false,
        }
    }

    /// Loads a chunk from memory.
    pub async fn load_chunk(&self, pos: ChunkPos) -> Option<ChunkData> {
        if let Some(saved) = self.saved_chunks.read().await.get(&pos) {
            return Some(saved.clone());
        }
        self.create_empty_on_miss.then(|| ChunkData::empty(pos))
    }

    /// Stores a chunk, replacing any earlier save.
    pub async fn save_chunk(&self, data: ChunkData) {
        self.saved_chunks.write().await.insert(data.pos, data);
    }

    /// Returns the saved copy of a chunk, if any.
    pub async fn saved(&self, pos: ChunkPos) -> Option<ChunkData> {
        self.saved_chunks.read().await.get(&pos).cloned()
    }

    /// Number of saved chunks.
    pub async fn saved_count(&self) -> usize {
        self.saved_chunks.read().await.len()
    }
}
