use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use regio_utils::ChunkPos;
use rustc_hash::FxHashMap;

use super::RegionStatsSnapshot;
use crate::chunk::{ChunkData, EntityRecord, LoadedChunk};
use crate::entity::{Entity, EntityDirectory, EntityId};
use crate::network::OutboundBatch;
use crate::task::{EntityTask, RegionTask};
use crate::ticks::DelayedQueue;

/// Everything a region owns. Only reachable by the thread holding the region's claim.
#[derive(Default)]
pub(crate) struct RegionData {
    pub(crate) tick: u64,
    pub(crate) chunks: FxHashMap<ChunkPos, LoadedChunk>,
    pub(crate) entities: FxHashMap<EntityId, Entity>,
    /// Queued tasks that did not fit in the previous tick. Run before anything newly queued.
    pub(crate) backlog: VecDeque<RegionTask>,
    pub(crate) delayed: DelayedQueue<RegionTask>,
    pub(crate) entity_tasks: Vec<EntityTask>,
    pub(crate) outbound: OutboundBatch,
}

impl RegionData {
    pub(crate) fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Moves everything from `other` into this region.
    ///
    /// Delayed tasks keep their remaining delay: due ticks are shifted by the difference between
    /// the two tick counters.
    pub(crate) fn merge_from(&mut self, mut other: Self) {
        self.chunks.extend(mem::take(&mut other.chunks));
        self.entities.extend(mem::take(&mut other.entities));
        self.backlog.extend(mem::take(&mut other.backlog));
        self.entity_tasks.append(&mut other.entity_tasks);
        self.outbound.absorb(mem::take(&mut other.outbound));

        let offset = self.tick.cast_signed() - other.tick.cast_signed();
        self.delayed.absorb(mem::take(&mut other.delayed), offset);
    }

    /// Partitions the region into `parts` regions. `assign` maps a column to its part; work with
    /// no position stays in part 0.
    pub(crate) fn split<F>(mut self, parts: usize, assign: F) -> Vec<Self>
    where
        F: Fn(ChunkPos) -> usize,
    {
        let mut out: Vec<Self> = (0..parts).map(|_| Self::new(self.tick)).collect();

        for (pos, chunk) in self.chunks.drain() {
            out[assign(pos)].chunks.insert(pos, chunk);
        }
        for (id, entity) in self.entities.drain() {
            out[assign(entity.chunk_pos())].entities.insert(id, entity);
        }
        for task in self.backlog.drain(..) {
            let index = task.anchor().map_or(0, &assign);
            out[index].backlog.push_back(task);
        }
        for task in self.entity_tasks.drain(..) {
            out[assign(task.entity().chunk_pos())].entity_tasks.push(task);
        }
        let delayed = mem::take(&mut self.delayed)
            .split(parts, |task| task.anchor().map_or(0, &assign));
        for (part, delayed) in out.iter_mut().zip(delayed) {
            part.delayed = delayed;
        }
        out[0].outbound = mem::take(&mut self.outbound);
        out
    }

    /// Adds a freshly loaded column and the entities stored with it. Returns how many entities
    /// were added.
    pub(crate) fn install_chunk(&mut self, data: ChunkData, directory: &EntityDirectory) -> usize {
        let pos = data.pos;
        if self.chunks.contains_key(&pos) {
            log::debug!("Chunk {pos} is already installed; ignoring the newer copy");
            return 0;
        }
        let (terrain, records) = data.into_parts();
        self.chunks.insert(pos, LoadedChunk::new(Arc::new(terrain)));

        let mut added = 0;
        for record in records {
            let entity = Entity::from_record(record);
            if !directory.insert(entity.reference()) {
                log::warn!(
                    "Skipping entity {} stored in chunk {pos}: its UUID is already in use",
                    entity.uuid()
                );
                continue;
            }
            self.entities.insert(entity.id(), entity);
            added += 1;
        }
        added
    }

    /// Removes a column together with the entities standing in it and returns what must be saved.
    pub(crate) fn remove_chunk(
        &mut self,
        pos: ChunkPos,
        directory: &EntityDirectory,
    ) -> Option<ChunkData> {
        let chunk = self.chunks.remove(&pos)?;
        let leaving: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, entity)| entity.chunk_pos() == pos)
            .map(|(id, _)| *id)
            .collect();
        let mut records: Vec<EntityRecord> = Vec::with_capacity(leaving.len());
        for id in leaving {
            if let Some(entity) = self.entities.remove(&id) {
                records.push(entity.to_record());
                entity.reference().mark_removed();
                directory.remove(entity.reference());
            }
        }
        Some(chunk.to_saved(records))
    }

    /// Removes every column and entity, returning what must be saved.
    ///
    /// Entities standing in a column this region does not hold come back untouched, for the
    /// caller to save with their own column.
    pub(crate) fn take_all_for_save(
        &mut self,
        directory: &EntityDirectory,
    ) -> (Vec<ChunkData>, Vec<Entity>) {
        let mut by_chunk: FxHashMap<ChunkPos, Vec<Entity>> = FxHashMap::default();
        for (_, entity) in self.entities.drain() {
            by_chunk.entry(entity.chunk_pos()).or_default().push(entity);
        }
        let saves = self
            .chunks
            .drain()
            .map(|(pos, chunk)| {
                let records = by_chunk
                    .remove(&pos)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|entity| {
                        entity.reference().mark_removed();
                        directory.remove(entity.reference());
                        entity.to_record()
                    })
                    .collect();
                chunk.to_saved(records)
            })
            .collect();
        (saves, by_chunk.into_values().flatten().collect())
    }

    pub(crate) fn stats(&self) -> RegionStatsSnapshot {
        RegionStatsSnapshot {
            chunks: self.chunks.len(),
            entities: self.entities.len(),
            players: self.entities.values().filter(|e| e.is_player()).count(),
        }
    }
}
