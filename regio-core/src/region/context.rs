//! The view a region tick has of its own data.

use std::time::{Duration, Instant};

use regio_utils::ChunkPos;
use regio_utils::locks::SyncArcMutexGuard;
use uuid::Uuid;

use super::{RegionData, RegionHandle, RegionId};
use crate::chunk::{ChunkData, ChunkLevel, LoadedChunk};
use crate::entity::{Entity, EntityId, EntityPosition, EntityRef};
use crate::network::{ConnectionId, OutboundPacket};
use crate::scheduler::{ChunkTaskSpec, RegionScheduler, hand_over};
use crate::task::RegionTask;
use crate::token::{OwnershipToken, assert_owns};

/// Exclusive access to one region for the duration of a tick.
///
/// Only the worker ticking the region can create one, and it cannot leave that thread. Every task
/// and the simulation hook receive it by mutable reference.
pub struct RegionContext {
    region: RegionHandle,
    data: SyncArcMutexGuard<RegionData>,
    scheduler: RegionScheduler,
    deadline: Instant,
    _token: OwnershipToken,
}

impl RegionContext {
    pub(crate) fn enter(
        region: &RegionHandle,
        scheduler: &RegionScheduler,
        deadline: Instant,
    ) -> Self {
        let token = OwnershipToken::acquire(region);
        Self {
            region: region.clone(),
            data: region.data.lock_arc(),
            scheduler: scheduler.clone(),
            deadline,
            _token: token,
        }
    }

    pub(crate) fn data(&mut self) -> &mut RegionData {
        &mut self.data
    }

    /// The region being ticked.
    #[must_use]
    pub const fn region(&self) -> &RegionHandle {
        &self.region
    }

    /// Shorthand for `self.region().id()`.
    #[must_use]
    pub fn id(&self) -> RegionId {
        self.region.id()
    }

    /// The scheduler, for submitting work elsewhere.
    #[must_use]
    pub const fn scheduler(&self) -> &RegionScheduler {
        &self.scheduler
    }

    /// The region's tick counter.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.data.tick
    }

    /// When this tick should be done.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn time_left(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the column is loaded in this region.
    #[must_use]
    pub fn owns_chunk(&self, pos: ChunkPos) -> bool {
        self.data.chunks.contains_key(&pos)
    }

    /// Every column loaded in this region.
    pub fn chunk_positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.data.chunks.keys().copied()
    }

    /// A loaded column of this region.
    #[must_use]
    pub fn chunk(&self, pos: ChunkPos) -> Option<&LoadedChunk> {
        self.data.chunks.get(&pos)
    }

    /// Mutable access to a loaded column of this region.
    pub fn chunk_mut(&mut self, pos: ChunkPos) -> Option<&mut LoadedChunk> {
        assert_owns(&self.region);
        self.data.chunks.get_mut(&pos)
    }

    /// Entities in this region.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.data.entities.values()
    }

    /// An entity of this region.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.data.entities.get(&id)
    }

    /// Spawns an entity.
    ///
    /// # Panics
    /// Panics if the column at `position` is not loaded in this region.
    pub fn spawn_entity(&mut self, kind: &str, position: EntityPosition) -> EntityRef {
        self.insert_new_entity(Entity::new(Uuid::new_v4(), kind.to_owned(), position, None))
    }

    /// Spawns the entity of a connected player.
    ///
    /// # Panics
    /// Panics if the column at `position` is not loaded in this region.
    pub fn spawn_player(
        &mut self,
        uuid: Uuid,
        connection: ConnectionId,
        position: EntityPosition,
    ) -> EntityRef {
        self.insert_new_entity(Entity::new(
            uuid,
            "player".to_owned(),
            position,
            Some(connection),
        ))
    }

    #[track_caller]
    fn insert_new_entity(&mut self, entity: Entity) -> EntityRef {
        assert_owns(&self.region);
        let chunk = entity.chunk_pos();
        assert!(
            self.owns_chunk(chunk),
            "region {} tried to spawn {} in chunk {chunk}, which it does not own",
            self.region.id(),
            entity.kind()
        );
        let reference = entity.reference().clone();
        if !self.scheduler.entities().insert(&reference) {
            log::warn!("Spawned entity {} reuses a live UUID", reference.uuid());
        }
        self.data.entities.insert(entity.id(), entity);
        reference
    }

    /// Removes an entity from the world. Pending entity tasks for it retire.
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        assert_owns(&self.region);
        let Some(entity) = self.data.entities.remove(&id) else {
            return false;
        };
        entity.reference().mark_removed();
        self.scheduler.entities().remove(entity.reference());
        true
    }

    /// Moves an entity. Returns `false` if the entity is not in this region after the move.
    ///
    /// An entity leaving the region's columns is handed to the region owning its new column,
    /// loading the column first if needed. Until it arrives, tasks for it are retried.
    pub fn move_entity(&mut self, id: EntityId, position: EntityPosition) -> bool {
        assert_owns(&self.region);
        if self.owns_chunk(position.chunk_pos()) {
            return match self.data.entities.get_mut(&id) {
                Some(entity) => {
                    entity.set_position(position);
                    true
                }
                None => false,
            };
        }
        let Some(mut entity) = self.data.entities.remove(&id) else {
            return false;
        };
        entity.set_position(position);
        self.transfer_entity(entity);
        false
    }

    /// Hands an entity to whoever owns its column. If the hand-over retires, the entity is parked
    /// with the scheduler rather than lost.
    fn transfer_entity(&self, entity: Entity) {
        let target = entity.chunk_pos();
        let uuid = entity.uuid();
        entity.reference().set_in_transit(true);
        log::trace!(
            "Region {} hands entity {uuid} over to whoever owns chunk {target}",
            self.region.id()
        );

        let (adopt, retire) = hand_over(&self.scheduler, vec![entity]);
        if let Err(err) = self.scheduler.schedule_for_chunk(
            ChunkTaskSpec::new(target, 0, ChunkLevel::Border),
            0,
            adopt,
            Some(retire),
        ) {
            log::debug!("Entity {uuid} could not be handed over to chunk {target}: {err}");
        }
    }

    pub(crate) fn adopt_entity(&mut self, entity: Entity) {
        assert_owns(&self.region);
        if !self.owns_chunk(entity.chunk_pos()) {
            log::debug!(
                "Region {} does not hold chunk {} of entity {}; parking it",
                self.region.id(),
                entity.chunk_pos(),
                entity.uuid()
            );
            self.scheduler.strand_entity(entity);
            return;
        }
        entity.reference().set_in_transit(false);
        self.data.entities.insert(entity.id(), entity);
    }

    pub(crate) fn install_chunk(&mut self, data: ChunkData) {
        assert_owns(&self.region);
        let directory = self.scheduler.entities();
        self.data.install_chunk(data, directory);
    }

    pub(crate) fn unload_chunk(&mut self, pos: ChunkPos) {
        assert_owns(&self.region);
        let chunks = self.scheduler.chunks().clone();
        if !chunks.begin_unload(pos) {
            return;
        }
        let directory = self.scheduler.entities();
        match self.data.remove_chunk(pos, directory) {
            Some(saved) => chunks.save_and_release(saved),
            None => chunks.release_unsaved(pos),
        }
    }

    /// Queues a packet for `connection`, sent after this tick.
    pub fn send_packet(&mut self, connection: ConnectionId, packet: OutboundPacket) {
        self.data.outbound.push(connection, packet);
    }

    /// Runs `task` on this region after `delay` of its ticks. A delay of zero runs it later in
    /// the current tick, or at the start of the next one if the tick already ran its due tasks.
    pub fn schedule_local<F>(&mut self, delay: u64, task: F)
    where
        F: FnOnce(&mut Self) + Send + 'static,
    {
        let due = self.data.tick + delay;
        self.data.delayed.schedule(RegionTask::once(0, task), due);
    }

    /// Runs a task if its anchor is here, otherwise hands it to the owner of the anchor.
    pub(crate) fn run_task(&mut self, task: RegionTask) -> bool {
        if let Some(anchor) = task.anchor()
            && !self.owns_chunk(anchor)
        {
            match self.scheduler.section_owner(anchor) {
                Some(owner) if owner != self.region => {
                    if let Err(task) = owner.queue().push_region(task) {
                        drop(task);
                    }
                    return false;
                }
                Some(_) => {}
                None => {
                    log::debug!(
                        "Retiring task anchored at {anchor}: no region owns that chunk any more"
                    );
                    return false;
                }
            }
        }
        if let Some((task, period)) = task.run(self) {
            let due = self.data.tick + period;
            self.data.delayed.schedule(task, due);
        }
        true
    }
}

/// An entity inside the region currently being ticked, handed to entity tasks.
pub struct EntityHandle<'a> {
    ctx: &'a mut RegionContext,
    id: EntityId,
}

impl<'a> EntityHandle<'a> {
    pub(crate) fn new(ctx: &'a mut RegionContext, id: EntityId) -> Self {
        Self { ctx, id }
    }

    /// The entity's id.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// The entity, unless it was removed or moved away during this task.
    #[must_use]
    pub fn entity(&self) -> Option<&Entity> {
        self.ctx.entity(self.id)
    }

    /// The region the entity is in.
    pub fn context(&mut self) -> &mut RegionContext {
        self.ctx
    }

    /// Moves the entity. Returns `false` once it left the region.
    pub fn move_to(&mut self, position: EntityPosition) -> bool {
        self.ctx.move_entity(self.id, position)
    }

    /// Removes the entity from the world.
    pub fn remove(self) -> bool {
        self.ctx.remove_entity(self.id)
    }

    /// Queues a packet for the entity's connection. Does nothing for entities without one.
    pub fn send_packet(&mut self, packet: OutboundPacket) {
        if let Some(connection) = self.entity().and_then(Entity::connection) {
            self.ctx.send_packet(connection, packet);
        }
    }
}
