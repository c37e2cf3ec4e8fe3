//! Entities that lost their region.
//!
//! An entity crossing into another region travels inside a chunk task. If that task retires
//! instead of running, or the entity reaches a region that does not hold its column, the entity is
//! parked here. Every global tick hands parked entities to the region owning their column, or
//! writes them into the stored column when nobody has it loaded. Halting writes out whatever is
//! still parked once every region has saved.

use std::mem;
use std::sync::Arc;

use regio_utils::ChunkPos;
use regio_utils::locks::SyncMutex;
use rustc_hash::FxHashMap;

use super::RegionScheduler;
use crate::chunk::{ChunkLoadState, EntityRecord};
use crate::entity::Entity;
use crate::region::RegionContext;
use crate::task::{RegionTask, RetireFn};

#[derive(Default)]
pub(crate) struct StrandedEntities(SyncMutex<FxHashMap<ChunkPos, Vec<Entity>>>);

impl StrandedEntities {
    fn push(&self, entity: Entity) {
        self.0
            .lock()
            .entry(entity.chunk_pos())
            .or_default()
            .push(entity);
    }

    fn restore(&self, pos: ChunkPos, entities: Vec<Entity>) {
        self.0.lock().entry(pos).or_default().extend(entities);
    }

    fn take_all(&self) -> FxHashMap<ChunkPos, Vec<Entity>> {
        mem::take(&mut *self.0.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().values().map(Vec::len).sum()
    }
}

/// Builds the two halves of a hand-over: `adopt` moves the entities into the region it runs on,
/// `retire` parks them again if it never runs.
pub(crate) fn hand_over(
    scheduler: &RegionScheduler,
    entities: Vec<Entity>,
) -> (impl FnOnce(&mut RegionContext) + Send + 'static, RetireFn) {
    let slot = Arc::new(SyncMutex::new(entities));
    let adopt = {
        let slot = slot.clone();
        move |ctx: &mut RegionContext| {
            for entity in mem::take(&mut *slot.lock()) {
                ctx.adopt_entity(entity);
            }
        }
    };
    let scheduler = scheduler.clone();
    let retire: RetireFn = Box::new(move || {
        for entity in mem::take(&mut *slot.lock()) {
            scheduler.strand_entity(entity);
        }
    });
    (adopt, retire)
}

impl RegionScheduler {
    /// Parks an entity that has no region to live in right now.
    pub(crate) fn strand_entity(&self, entity: Entity) {
        log::debug!(
            "Entity {} at chunk {} is waiting for a region",
            entity.uuid(),
            entity.chunk_pos()
        );
        entity.reference().set_in_transit(true);
        self.0.stranded.push(entity);
    }

    /// Entities currently parked.
    #[must_use]
    pub fn stranded_entities(&self) -> usize {
        self.0.stranded.len()
    }

    /// Places parked entities. Runs on the global tick thread.
    pub(super) fn place_stranded(&self) {
        for (pos, entities) in self.0.stranded.take_all() {
            match self.chunks().state(pos) {
                ChunkLoadState::Loaded => match self.resolve_owner(pos) {
                    Some(owner) => {
                        let (adopt, retire) = hand_over(self, entities);
                        let task = RegionTask::once(0, adopt)
                            .anchored(pos)
                            .retired_by(Some(retire));
                        if let Err(task) = owner.queue().push_region(task) {
                            drop(task);
                        }
                    }
                    None => self.0.stranded.restore(pos, entities),
                },
                ChunkLoadState::Unloaded => {
                    if self.chunks().begin_entity_write(pos) {
                        let records = self.take_out_of_world(entities);
                        self.chunks().write_entities(pos, records);
                    } else {
                        self.0.stranded.restore(pos, entities);
                    }
                }
                ChunkLoadState::Loading | ChunkLoadState::Saving => {
                    self.0.stranded.restore(pos, entities);
                }
                ChunkLoadState::Failed => {
                    log::error!(
                        "Dropping {} entities bound for chunk {pos}, which failed to load",
                        entities.len()
                    );
                    self.take_out_of_world(entities);
                }
            }
        }
    }

    /// Writes every parked entity into its stored column. Runs on the shutdown thread once no
    /// region is left.
    pub(super) fn save_stranded(&self) {
        let batches: Vec<(ChunkPos, Vec<EntityRecord>)> = self
            .0
            .stranded
            .take_all()
            .into_iter()
            .map(|(pos, entities)| (pos, self.take_out_of_world(entities)))
            .collect();
        if !batches.is_empty() {
            self.chunks().write_entities_blocking(batches);
        }
    }

    /// Drops entities parked too late to be saved.
    pub(super) fn discard_stranded(&self) {
        let left = self.0.stranded.take_all();
        let count: usize = left.values().map(Vec::len).sum();
        if count > 0 {
            log::error!("{count} entities were still between regions after shutdown and are lost");
        }
        for entities in left.into_values() {
            self.take_out_of_world(entities);
        }
    }

    fn take_out_of_world(&self, entities: Vec<Entity>) -> Vec<EntityRecord> {
        entities
            .into_iter()
            .map(|entity| {
                entity.reference().set_in_transit(false);
                entity.reference().mark_removed();
                self.entities().remove(entity.reference());
                entity.to_record()
            })
            .collect()
    }
}
