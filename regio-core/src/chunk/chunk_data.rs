use std::mem;
use std::sync::Arc;

use regio_utils::ChunkPos;
use uuid::Uuid;

use crate::entity::EntityPosition;

/// A persisted entity, as stored inside its chunk column.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Stable identity across saves.
    pub uuid: Uuid,
    /// Entity type name.
    pub kind: String,
    /// Position in block coordinates.
    pub position: EntityPosition,
}

/// The persisted contents of one chunk column.
///
/// `payload` is opaque to the scheduler; only the simulation interprets it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    /// Column position.
    pub pos: ChunkPos,
    /// Terrain and block entity data.
    pub payload: Vec<u8>,
    /// Entities saved with this column. Empty while the column is loaded; live entities are held
    /// by the owning region instead.
    pub entities: Vec<EntityRecord>,
}

impl ChunkData {
    /// A column with no payload and no entities.
    #[must_use]
    pub const fn empty(pos: ChunkPos) -> Self {
        Self {
            pos,
            payload: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Splits off the entity records, leaving the terrain part.
    #[must_use]
    pub fn into_parts(mut self) -> (Self, Vec<EntityRecord>) {
        let entities = mem::take(&mut self.entities);
        (self, entities)
    }
}

/// A column resident in a region.
#[derive(Debug, Clone)]
pub struct LoadedChunk {
    data: Arc<ChunkData>,
    dirty: bool,
}

impl LoadedChunk {
    pub(crate) const fn new(data: Arc<ChunkData>) -> Self {
        Self { data, dirty: false }
    }

    /// Column position.
    #[must_use]
    pub fn pos(&self) -> ChunkPos {
        self.data.pos
    }

    /// Terrain payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data.payload
    }

    /// Mutable access to the payload. Marks the column dirty.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        self.dirty = true;
        &mut Arc::make_mut(&mut self.data).payload
    }

    /// Whether the payload changed since the column was loaded.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Builds the column to hand to storage, with `entities` as the saved entity list.
    pub(crate) fn to_saved(&self, entities: Vec<EntityRecord>) -> ChunkData {
        ChunkData {
            pos: self.data.pos,
            payload: self.data.payload.clone(),
            entities,
        }
    }
}
