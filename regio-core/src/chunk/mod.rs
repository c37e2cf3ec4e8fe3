//! Chunk columns, their tickets and the load pipeline.

mod chunk_data;
mod chunk_holder;
mod chunk_level;
mod generator;
mod holder_manager;

pub use chunk_data::{ChunkData, EntityRecord, LoadedChunk};
pub(crate) use chunk_holder::{ChunkHolder, LoadSender, PendingLoad};
pub use chunk_holder::{ChunkHolderInfo, ChunkLoad, ChunkLoadFuture, ChunkLoadState};
pub use chunk_level::{ChunkLevel, Ticket, TicketType};
pub use generator::{ChunkGenerator, FlatChunkGenerator};
pub use holder_manager::{ChunkHolderManager, TicketGuard, TicketHandle};
