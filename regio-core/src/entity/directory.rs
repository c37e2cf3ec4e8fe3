use scc::HashMap;
use uuid::Uuid;

use super::EntityRef;

/// Finds live entities by UUID from any thread.
///
/// Entries are added when an entity is spawned or loaded and removed when it is removed or
/// unloaded. A lookup only yields a reference; acting on the entity still goes through the
/// entity scheduler.
#[derive(Default)]
pub struct EntityDirectory {
    by_uuid: HashMap<Uuid, EntityRef>,
}

impl EntityDirectory {
    /// Registers an entity. Returns `false` if another live entity already uses the UUID.
    pub fn insert(&self, entity: &EntityRef) -> bool {
        self.by_uuid.insert_sync(entity.uuid(), entity.clone()).is_ok()
    }

    /// Unregisters `entity`, unless its UUID has since been taken by a different entity.
    pub fn remove(&self, entity: &EntityRef) {
        let _ = self
            .by_uuid
            .remove_if_sync(&entity.uuid(), |current| *current == *entity);
    }

    /// Looks up a live entity.
    #[must_use]
    pub fn get(&self, uuid: &Uuid) -> Option<EntityRef> {
        self.by_uuid.read_sync(uuid, |_, entity| entity.clone())
    }

    /// Number of registered entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// Returns true if no entities are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}
