//! The global tick thread.
//!
//! This is the only thread that changes the topology. It assigns freshly loaded columns to
//! regions, drops unloaded ones, creates, merges, splits and destroys regions, runs global tasks
//! and redispatches entity tasks that missed their entity. Between ticks it serves
//! [`ControlCommand`]s sent by the chunk pipeline and the shutdown thread.
//!
//! It never holds the topology write lock while waiting for a region claim, and it only touches
//! region data while holding that region's claim.

use std::cmp::Reverse;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use regio_utils::{ChunkPos, RegionSectionPos};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{CrashCause, CrashReport, GlobalContext, RegionScheduler, ServerStatus, crash_report};
use crate::chunk::{ChunkData, ChunkLoad, LoadSender};
use crate::error::{ChunkIoError, ChunkLoadError};
use crate::region::{RegionData, RegionHandle, RegionId, RegionState, RegionStatsSnapshot};
use crate::task::{EntityTask, GlobalTask, RegionTask, RetryDecision};
use crate::ticks::DelayedQueue;
use crate::token::{ThreadRole, set_thread_role};

/// Requests served by the global tick thread between ticks.
pub(crate) enum ControlCommand {
    /// A column finished loading and needs an owner.
    ChunkLoaded {
        data: ChunkData,
        reply: LoadSender,
    },
    /// A column left its region and was written back.
    ChunkReleased {
        pos: ChunkPos,
        result: Result<(), ChunkIoError>,
    },
    /// Start halting every region.
    Halt,
    /// Exit the loop.
    Stop,
}

pub(super) fn run(scheduler: &RegionScheduler, commands: &Receiver<ControlCommand>) {
    set_thread_role(ThreadRole::Global);
    let period = scheduler.config().tick_period();
    let max_behind = period * scheduler.config().max_catchup_ticks;
    let mut ticker = GlobalTicker::new(scheduler.clone());
    let mut next_tick = Instant::now() + period;

    loop {
        let now = Instant::now();
        if now >= next_tick {
            ticker.tick_guarded();
            next_tick += period;
            if let Some(floor) = now.checked_sub(max_behind)
                && next_tick < floor
            {
                next_tick = floor;
            }
            continue;
        }
        match commands.recv_deadline(next_tick) {
            Ok(ControlCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(command) => ticker.handle(command),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    while let Ok(command) = commands.try_recv() {
        match command {
            ControlCommand::ChunkLoaded { reply, .. } => {
                let _ = reply.send(Err(ChunkLoadError::ShuttingDown));
            }
            ControlCommand::ChunkReleased { pos, result } => {
                scheduler.chunks().finish_unload(pos, result);
            }
            ControlCommand::Halt | ControlCommand::Stop => {}
        }
    }
    log::debug!("Global tick thread stopped");
}

/// A crash report for the global tick, built from lock-free counters only.
pub(super) fn global_crash_report(scheduler: &RegionScheduler, cause: CrashCause) -> CrashReport {
    CrashReport::for_global(
        scheduler.current_tick(),
        scheduler.status().loaded_chunks,
        scheduler.entities().len(),
        scheduler.global_running_for(),
        cause,
    )
}

struct GlobalTicker {
    scheduler: RegionScheduler,
    tasks: DelayedQueue<GlobalTask>,
    retries: DelayedQueue<EntityTask>,
    merge_streaks: FxHashMap<(RegionId, RegionId), u32>,
    split_streaks: FxHashMap<RegionId, u32>,
    last_status: Instant,
}

impl GlobalTicker {
    fn new(scheduler: RegionScheduler) -> Self {
        Self {
            scheduler,
            tasks: DelayedQueue::new(),
            retries: DelayedQueue::new(),
            merge_streaks: FxHashMap::default(),
            split_streaks: FxHashMap::default(),
            last_status: Instant::now(),
        }
    }

    fn handle(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::ChunkLoaded { data, reply } => {
                let result = self.assign_chunk(data);
                let _ = reply.send(result);
            }
            ControlCommand::ChunkReleased { pos, result } => {
                self.scheduler.0.topology.write().map.remove_chunk(pos);
                self.scheduler.chunks().finish_unload(pos, result);
            }
            ControlCommand::Halt => self.begin_halt(),
            ControlCommand::Stop => {}
        }
    }

    fn tick_guarded(&mut self) {
        let ticked = panic::catch_unwind(AssertUnwindSafe(|| self.tick()));
        if let Err(payload) = ticked {
            let report = global_crash_report(
                &self.scheduler,
                CrashCause::Panic(crash_report::panic_message(payload.as_ref())),
            )
            .on_current_thread();
            *self.scheduler.0.global_tick_started.lock() = None;
            self.scheduler.handle_crash(&report);
        }
    }

    fn tick(&mut self) {
        let started = Instant::now();
        *self.scheduler.0.global_tick_started.lock() = Some(started);
        let tick = self.scheduler.0.global_tick.fetch_add(1, Ordering::AcqRel) + 1;

        self.run_global_tasks(tick);
        self.process_entity_retries(tick);
        if !self.scheduler.is_halting() {
            self.process_unloads(tick);
            self.scheduler.place_stranded();
            self.collect_garbage();
            self.merge_pass();
            self.split_pass();
        }
        self.refresh_status(started);

        let ended = Instant::now();
        *self.scheduler.0.global_tick_started.lock() = None;
        self.scheduler.0.global_times.lock().record(started, ended);
    }

    fn run_global_tasks(&mut self, tick: u64) {
        while let Some(mut task) = self.scheduler.0.global_tasks.pop() {
            let delay = task.take_delay();
            self.tasks.schedule(task, tick + delay);
        }
        let ctx = GlobalContext::new(&self.scheduler, tick);
        while let Some(task) = self.tasks.pop_due(tick) {
            if let Some((task, period)) = task.run(&ctx) {
                self.tasks.schedule(task, tick + period);
            }
        }
    }

    fn process_entity_retries(&mut self, tick: u64) {
        if self.scheduler.is_halting() {
            // Retire everything still waiting.
            while self.scheduler.0.entity_retries.pop().is_some() {}
            drop(self.retries.drain_ordered());
            return;
        }
        while let Some(task) = self.retries.pop_due(tick) {
            if task.entity().is_removed() {
                continue;
            }
            if let Err(task) = self.scheduler.dispatch_entity_task(task) {
                self.defer(task, tick);
            }
        }
        while let Some(task) = self.scheduler.0.entity_retries.pop() {
            self.defer(task, tick);
        }
    }

    fn defer(&mut self, mut task: EntityTask, tick: u64) {
        if task.entity().is_removed() {
            return;
        }
        let attempts = task.fail_attempt();
        match self.scheduler.0.retry.decide(attempts) {
            RetryDecision::RetryAfter(ticks) => self.retries.schedule(task, tick + ticks),
            RetryDecision::GiveUp => log::debug!(
                "Giving up on a task for entity {} after {attempts} attempts",
                task.entity().uuid()
            ),
        }
    }

    fn process_unloads(&self, tick: u64) {
        let chunks = self.scheduler.chunks();
        for pos in chunks.process_tick(tick) {
            let unload = RegionTask::once(0, move |ctx| ctx.unload_chunk(pos)).anchored(pos);
            let queued = match self.scheduler.resolve_owner(pos) {
                Some(owner) => owner.queue().push_region(unload).is_ok(),
                None => false,
            };
            if !queued && chunks.begin_unload(pos) {
                chunks.release_unsaved(pos);
            }
        }
    }

    fn collect_garbage(&mut self) {
        let dead: Vec<RegionHandle> = {
            let mut topology = self.scheduler.0.topology.write();
            let ids = topology.map.collect_garbage();
            ids.into_iter()
                .filter_map(|id| topology.remove_region(id))
                .collect()
        };
        for region in dead {
            self.split_streaks.remove(&region.id());
            self.destroy(&region);
        }
    }

    /// Tears down a region that owns no sections any more.
    fn destroy(&self, region: &RegionHandle) {
        self.scheduler.claim_blocking(region);
        let queued = region.queue().close();
        let data = mem::take(&mut *region.data.lock());
        region.set_state(RegionState::Dead);
        region.publish_stats(RegionStatsSnapshot::default());
        self.scheduler.release(region);
        self.scheduler.region_died();
        log::debug!("Destroyed empty region {}", region.id());

        let RegionData {
            chunks,
            entities,
            backlog,
            mut delayed,
            entity_tasks,
            ..
        } = data;
        if !chunks.is_empty() {
            log::warn!(
                "Region {} was destroyed with {} chunks still installed",
                region.id(),
                chunks.len()
            );
        }
        for entity in entities.into_values() {
            self.scheduler.strand_entity(entity);
        }
        let tasks = queued
            .region_tasks
            .into_iter()
            .chain(backlog)
            .chain(delayed.drain_ordered());
        for task in tasks {
            self.reroute(task);
        }
        for task in queued.entity_tasks.into_iter().chain(entity_tasks) {
            self.scheduler.retry_entity_task(task);
        }
    }

    /// Hands an anchored task to whoever owns its anchor now. Anything else retires.
    fn reroute(&self, task: RegionTask) {
        let Some(owner) = task.anchor().and_then(|pos| self.scheduler.section_owner(pos)) else {
            return;
        };
        if let Err(task) = owner.queue().push_region(task) {
            drop(task);
        }
    }

    fn assign_chunk(&mut self, data: ChunkData) -> Result<ChunkLoad, ChunkLoadError> {
        if self.scheduler.is_halting() {
            return Err(ChunkLoadError::ShuttingDown);
        }
        let pos = data.pos;
        let (existing, near) = {
            let topology = self.scheduler.0.topology.read();
            let existing = topology.owner(pos).cloned();
            let near: Vec<RegionHandle> = topology
                .map
                .regions_near(pos)
                .iter()
                .filter_map(|id| topology.region(*id).cloned())
                .collect();
            (existing, near)
        };
        if let Some(owner) = existing {
            log::debug!("Chunk {pos} finished loading but is already owned by {}", owner.id());
            return Ok(ChunkLoad { pos, owner });
        }

        let owner = match near.len() {
            0 => self.create_region(),
            1 => near[0].clone(),
            _ => self.merge_regions(&near),
        };
        self.scheduler
            .0
            .topology
            .write()
            .map
            .add_chunk(pos, owner.id());

        let install = RegionTask::once(0, move |ctx| ctx.install_chunk(data)).anchored(pos);
        if owner.queue().push_region(install).is_err() {
            self.scheduler.0.topology.write().map.remove_chunk(pos);
            return Err(ChunkLoadError::Cancelled);
        }
        self.scheduler.invalidate_status();
        Ok(ChunkLoad { pos, owner })
    }

    fn create_region(&self) -> RegionHandle {
        let now = Instant::now();
        let region = RegionHandle::new(RegionId::next(), RegionData::new(0), now);
        self.scheduler
            .0
            .topology
            .write()
            .insert_region(region.clone());
        self.scheduler.region_created();
        self.scheduler.pool().schedule(&self.scheduler, &region, now);
        log::debug!("Created region {}", region.id());
        region
    }

    /// Merges `regions` into the one owning the most sections and returns it.
    fn merge_regions(&mut self, regions: &[RegionHandle]) -> RegionHandle {
        let survivor = {
            let topology = self.scheduler.0.topology.read();
            regions
                .iter()
                .max_by_key(|region| {
                    (
                        topology.map.section_count(region.id()),
                        Reverse(region.id()),
                    )
                })
                .cloned()
        };
        let Some(survivor) = survivor else {
            return self.create_region();
        };
        let absorbed: Vec<RegionHandle> = regions
            .iter()
            .filter(|region| **region != survivor)
            .cloned()
            .collect();

        self.scheduler.claim_blocking(&survivor);
        for region in &absorbed {
            self.scheduler.claim_blocking(region);
        }
        let survivor_state = survivor.state();
        survivor.set_state(RegionState::Merging);
        for region in &absorbed {
            region.set_state(RegionState::Merging);
        }

        {
            let mut topology = self.scheduler.0.topology.write();
            for region in &absorbed {
                topology.map.merge(region.id(), survivor.id());
                topology.remove_region(region.id());
            }
        }

        let mut next_start = survivor.schedule.lock().next_start;
        {
            let mut data = survivor.data.lock();
            for region in &absorbed {
                let taken = mem::take(&mut *region.data.lock());
                data.merge_from(taken);
                let queued = region.queue().forward_to(survivor.clone());
                data.backlog.extend(queued.region_tasks);
                data.entity_tasks.extend(queued.entity_tasks);
                survivor.absorb_times(region);
                next_start = next_start.max(region.schedule.lock().next_start);
                region.publish_stats(RegionStatsSnapshot::default());
                region.set_state(RegionState::Dead);
            }
            survivor.publish_stats(data.stats());
        }
        survivor.set_state(if survivor_state == RegionState::Starting {
            RegionState::Starting
        } else {
            RegionState::Ticking
        });

        for region in &absorbed {
            self.scheduler.release(region);
            self.scheduler.region_died();
            self.split_streaks.remove(&region.id());
            log::debug!("Merged region {} into {}", region.id(), survivor.id());
        }
        self.scheduler.release(&survivor);
        self.scheduler
            .pool()
            .schedule(&self.scheduler, &survivor, next_start);
        survivor
    }

    fn merge_pass(&mut self) {
        let config = self.scheduler.config();
        let (merge_radius, merge_ticks) = (config.merge_radius, config.merge_ticks.max(1));
        let candidates = self
            .scheduler
            .0
            .topology
            .read()
            .map
            .merge_candidates(merge_radius);

        let mut streaks = FxHashMap::default();
        for pair in candidates {
            let streak = self.merge_streaks.get(&pair).copied().unwrap_or(0) + 1;
            streaks.insert(pair, streak);
        }

        let mut due: Vec<_> = streaks
            .iter()
            .filter(|(_, streak)| **streak >= merge_ticks)
            .map(|(pair, _)| *pair)
            .collect();
        due.sort_unstable();
        let mut merged: FxHashSet<RegionId> = FxHashSet::default();
        for (a, b) in due {
            if merged.contains(&a) || merged.contains(&b) {
                // Retried next tick against whatever survived.
                streaks.insert((a, b), merge_ticks - 1);
                continue;
            }
            let handles: Vec<RegionHandle> = {
                let topology = self.scheduler.0.topology.read();
                [a, b]
                    .iter()
                    .filter_map(|id| topology.region(*id).cloned())
                    .collect()
            };
            streaks.remove(&(a, b));
            if handles.len() == 2 {
                self.merge_regions(&handles);
                merged.insert(a);
                merged.insert(b);
            }
        }
        self.merge_streaks = streaks;
    }

    fn split_pass(&mut self) {
        let config = self.scheduler.config();
        let (split_distance, split_ticks) = (config.split_distance, config.split_ticks.max(1));
        let splittable: Vec<RegionHandle> = {
            let topology = self.scheduler.0.topology.read();
            topology
                .regions()
                .filter(|region| topology.map.split_plan(region.id(), split_distance).len() >= 2)
                .cloned()
                .collect()
        };

        let mut streaks = FxHashMap::default();
        for region in splittable {
            let streak = self.split_streaks.get(&region.id()).copied().unwrap_or(0) + 1;
            if streak >= split_ticks {
                self.split_region(&region);
            } else {
                streaks.insert(region.id(), streak);
            }
        }
        self.split_streaks = streaks;
    }

    fn split_region(&self, region: &RegionHandle) {
        let config = self.scheduler.config();
        let shift = config.section_shift;
        self.scheduler.claim_blocking(region);
        let plan = self
            .scheduler
            .0
            .topology
            .read()
            .map
            .split_plan(region.id(), config.split_distance);
        if region.is_dead() {
            self.scheduler.release(region);
            return;
        }
        let next_start = region.schedule.lock().next_start;
        if plan.len() < 2 {
            self.scheduler.release(region);
            self.scheduler.pool().schedule(&self.scheduler, region, next_start);
            return;
        }
        let previous_state = region.state();
        region.set_state(RegionState::Splitting);

        let mut part_of: FxHashMap<RegionSectionPos, usize> = FxHashMap::default();
        for (index, part) in plan.iter().enumerate() {
            for section in part {
                part_of.insert(*section, index);
            }
        }
        let assign = |pos: ChunkPos| part_of.get(&pos.section(shift)).copied().unwrap_or(0);

        let data = mem::take(&mut *region.data.lock());
        let mut parts = data.split(plan.len(), &assign).into_iter();
        if let Some(kept) = parts.next() {
            *region.data.lock() = kept;
        }
        let created: Vec<RegionHandle> = parts
            .map(|part| RegionHandle::new(RegionId::next(), part, next_start))
            .collect();

        {
            let ids: Vec<RegionId> = created.iter().map(|r| r.id()).collect();
            let mut topology = self.scheduler.0.topology.write();
            topology.map.apply_split(region.id(), &plan, &ids);
            for new_region in &created {
                topology.insert_region(new_region.clone());
            }
        }

        // Work queued since the last tick follows its anchor.
        let queued = region.queue().drain();
        {
            let mut data = region.data.lock();
            for task in queued.region_tasks {
                match task.anchor().map_or(0, &assign) {
                    0 => data.backlog.push_back(task),
                    index => {
                        if let Err(task) = created[index - 1].queue().push_region(task) {
                            drop(task);
                        }
                    }
                }
            }
            for task in queued.entity_tasks {
                match assign(task.entity().chunk_pos()) {
                    0 => data.entity_tasks.push(task),
                    index => {
                        if let Err(task) = created[index - 1].queue().push_entity(task) {
                            self.scheduler.retry_entity_task(task);
                        }
                    }
                }
            }
            region.publish_stats(data.stats());
        }
        for new_region in &created {
            new_region.publish_stats(new_region.data.lock().stats());
            self.scheduler.region_created();
        }
        region.set_state(if previous_state == RegionState::Starting {
            RegionState::Starting
        } else {
            RegionState::Ticking
        });
        self.scheduler.release(region);

        log::debug!(
            "Split region {} into {} regions ({})",
            region.id(),
            created.len() + 1,
            created
                .iter()
                .map(|r| r.id().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.scheduler.pool().schedule(&self.scheduler, region, next_start);
        for new_region in &created {
            self.scheduler
                .pool()
                .schedule(&self.scheduler, new_region, next_start);
        }
    }

    fn begin_halt(&mut self) {
        log::info!("Halting {} regions", self.scheduler.live_regions());
        self.scheduler.chunks().fail_pending();
        while self.scheduler.0.entity_retries.pop().is_some() {}
        drop(self.retries.drain_ordered());

        let regions = self.scheduler.regions();
        let now = Instant::now();
        for region in regions {
            if region.cas_state(RegionState::Ticking, RegionState::ShuttingDown)
                || region.cas_state(RegionState::Starting, RegionState::ShuttingDown)
            {
                self.scheduler.pool().schedule(&self.scheduler, &region, now);
            }
        }
        self.scheduler.invalidate_status();
    }

    fn refresh_status(&mut self, now: Instant) {
        let shared = &self.scheduler.0;
        let interval = Duration::from_millis(shared.config.status_interval_ms);
        let dirty = shared.status_dirty.swap(false, Ordering::AcqRel);
        if !dirty && now.duration_since(self.last_status) < interval {
            return;
        }
        let status = {
            let topology = shared.topology.read();
            let times = shared.global_times.lock();
            ServerStatus::build(shared.global_tick.load(Ordering::Acquire), &topology, &times)
        };
        shared.status.store(status.into());
        self.last_status = now;
    }
}
