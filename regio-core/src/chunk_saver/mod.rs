//! Chunk persistence.
//!
//! The scheduler never touches storage from a tick thread. Loads and saves run on the chunk I/O
//! runtime and report back through the chunk holder manager.
mod ram_only;
mod storage;

pub use ram_only::RamOnlyStorage;
pub use storage::{ChunkIo, ChunkStorage};
