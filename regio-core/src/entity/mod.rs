//! Entities and the handles used to address them from other threads.
//!
//! An [`Entity`] lives inside exactly one region's data and is only reachable through that
//! region's [`crate::region::RegionContext`]. An [`EntityRef`] is the cheap, shareable identity
//! other threads hold: it can answer where the entity was last seen and whether it still exists,
//! nothing more.

mod directory;

pub use directory::EntityDirectory;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use regio_utils::ChunkPos;
use uuid::Uuid;

use crate::chunk::EntityRecord;
use crate::network::ConnectionId;

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique runtime id. Not persisted; the UUID is the stable identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl EntityId {
    fn next() -> Self {
        Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A position in block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityPosition {
    /// x
    pub x: f64,
    /// y
    pub y: f64,
    /// z
    pub z: f64,
}

impl EntityPosition {
    /// Creates a position.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The chunk column containing this position.
    #[must_use]
    pub fn chunk_pos(self) -> ChunkPos {
        ChunkPos::from_block(self.x.floor() as i32, self.z.floor() as i32)
    }
}

#[derive(Debug)]
struct EntityShared {
    id: EntityId,
    uuid: Uuid,
    chunk: AtomicI64,
    removed: AtomicBool,
    in_transit: AtomicBool,
}

/// A thread-safe reference to an entity.
///
/// The chunk it reports is updated by the owning region as the entity moves, so it may lag by a
/// tick. Task routing tolerates that by re-checking ownership when the task runs.
#[derive(Debug, Clone)]
pub struct EntityRef(Arc<EntityShared>);

impl EntityRef {
    fn new(uuid: Uuid, chunk: ChunkPos) -> Self {
        Self(Arc::new(EntityShared {
            id: EntityId::next(),
            uuid,
            chunk: AtomicI64::new(chunk.as_i64()),
            removed: AtomicBool::new(false),
            in_transit: AtomicBool::new(false),
        }))
    }

    /// The runtime id.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.0.id
    }

    /// The persistent id.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.0.uuid
    }

    /// The chunk the entity was last placed in.
    #[must_use]
    pub fn chunk_pos(&self) -> ChunkPos {
        ChunkPos::from_i64(self.0.chunk.load(Ordering::Acquire))
    }

    /// `true` once the entity has been removed or unloaded. Removal is final.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.0.removed.load(Ordering::Acquire)
    }

    /// `true` while the entity is moving between regions and held by no region.
    #[must_use]
    pub fn is_in_transit(&self) -> bool {
        self.0.in_transit.load(Ordering::Acquire)
    }

    pub(crate) fn set_chunk(&self, chunk: ChunkPos) {
        self.0.chunk.store(chunk.as_i64(), Ordering::Release);
    }

    pub(crate) fn mark_removed(&self) {
        self.0.removed.store(true, Ordering::Release);
    }

    pub(crate) fn set_in_transit(&self, in_transit: bool) {
        self.0.in_transit.store(in_transit, Ordering::Release);
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EntityRef {}

/// A live entity. Owned by the region holding its chunk.
#[derive(Debug)]
pub struct Entity {
    reference: EntityRef,
    kind: String,
    position: EntityPosition,
    connection: Option<ConnectionId>,
}

impl Entity {
    pub(crate) fn new(
        uuid: Uuid,
        kind: String,
        position: EntityPosition,
        connection: Option<ConnectionId>,
    ) -> Self {
        Self {
            reference: EntityRef::new(uuid, position.chunk_pos()),
            kind,
            position,
            connection,
        }
    }

    pub(crate) fn from_record(record: EntityRecord) -> Self {
        Self::new(record.uuid, record.kind, record.position, None)
    }

    /// The persisted form. Connections are not persisted.
    #[must_use]
    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            uuid: self.reference.uuid(),
            kind: self.kind.clone(),
            position: self.position,
        }
    }

    /// The shareable reference.
    #[must_use]
    pub const fn reference(&self) -> &EntityRef {
        &self.reference
    }

    /// The runtime id.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.reference.id()
    }

    /// The persistent id.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.reference.uuid()
    }

    /// Entity type name.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Current position.
    #[must_use]
    pub const fn position(&self) -> EntityPosition {
        self.position
    }

    /// The chunk containing the current position.
    #[must_use]
    pub fn chunk_pos(&self) -> ChunkPos {
        self.position.chunk_pos()
    }

    /// The network connection controlling this entity, for players.
    #[must_use]
    pub const fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Whether a connection controls this entity.
    #[must_use]
    pub const fn is_player(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn set_position(&mut self, position: EntityPosition) {
        self.position = position;
        self.reference.set_chunk(position.chunk_pos());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_to_chunk() {
        assert_eq!(EntityPosition::new(-0.5, 64.0, 15.9).chunk_pos(), ChunkPos::new(-1, 0));
        assert_eq!(EntityPosition::new(32.0, 0.0, -17.0).chunk_pos(), ChunkPos::new(2, -2));
    }

    #[test]
    fn test_reference_tracks_moves() {
        let mut entity = Entity::new(
            Uuid::new_v4(),
            "pig".to_owned(),
            EntityPosition::new(1.0, 0.0, 1.0),
            None,
        );
        let reference = entity.reference().clone();
        assert_eq!(reference.chunk_pos(), ChunkPos::new(0, 0));

        entity.set_position(EntityPosition::new(40.0, 0.0, 1.0));
        assert_eq!(reference.chunk_pos(), ChunkPos::new(2, 0));
        assert!(!reference.is_removed());
    }

    #[test]
    fn test_record_keeps_identity() {
        let entity = Entity::new(
            Uuid::new_v4(),
            "zombie".to_owned(),
            EntityPosition::new(3.0, 70.0, -4.0),
            Some(ConnectionId(9)),
        );
        let restored = Entity::from_record(entity.to_record());
        assert_eq!(restored.uuid(), entity.uuid());
        assert_ne!(restored.id(), entity.id());
        assert!(!restored.is_player());
    }
}
