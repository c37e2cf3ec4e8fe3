use std::mem;
use std::time::{Duration, Instant};

use super::{RegionContext, RegionHandle, RegionState, RegionStatsSnapshot};
use crate::region::EntityHandle;
use crate::scheduler::RegionScheduler;
use crate::token::OwnershipToken;

/// Something the scheduler can tick and halt.
pub trait Tickable {
    /// Runs one tick. Must be called by the thread holding the region's claim.
    fn tick(&self, scheduler: &RegionScheduler, deadline: Instant) -> TickOutcome;

    /// Retires all pending work, saves everything and marks the region dead.
    fn halt(&self, scheduler: &RegionScheduler);
}

/// What happened during one region tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// The region's tick counter after the tick.
    pub tick: u64,
    /// Wall time the tick took.
    pub duration: Duration,
    /// Region and entity tasks run.
    pub tasks_run: usize,
    /// Consecutive ticks, this one included, that took longer than the tick period.
    pub overrun_streak: u32,
}

impl Tickable for RegionHandle {
    fn tick(&self, scheduler: &RegionScheduler, deadline: Instant) -> TickOutcome {
        let started = Instant::now();
        self.begin_tick(started);
        let mut ctx = RegionContext::enter(self, scheduler, deadline);
        let tick = {
            let data = ctx.data();
            data.tick += 1;
            data.tick
        };
        let mut tasks_run = 0;

        // Queued work, oldest first. Whatever does not fit before the deadline waits for the next
        // tick, ahead of anything queued later.
        let drained = self.queue().drain();
        ctx.data().backlog.extend(drained.region_tasks);
        ctx.data().entity_tasks.extend(drained.entity_tasks);
        while let Some(mut task) = ctx.data().backlog.pop_front() {
            let delay = task.take_delay();
            if delay > 0 {
                ctx.data().delayed.schedule(task, tick + delay);
                continue;
            }
            if ctx.run_task(task) {
                tasks_run += 1;
            }
            if Instant::now() >= deadline && !ctx.data().backlog.is_empty() {
                log::debug!(
                    "Region {} deferred {} queued tasks to its next tick",
                    self.id(),
                    ctx.data().backlog.len()
                );
                break;
            }
        }

        while let Some(task) = ctx.data().delayed.pop_due(tick) {
            if ctx.run_task(task) {
                tasks_run += 1;
            }
        }

        let entity_tasks = mem::take(&mut ctx.data().entity_tasks);
        for mut task in entity_tasks {
            if task.entity().is_removed() {
                continue;
            }
            if task.wait_tick() {
                ctx.data().entity_tasks.push(task);
                continue;
            }
            let id = task.entity().id();
            if ctx.entity(id).is_some() {
                task.run(EntityHandle::new(&mut ctx, id));
                tasks_run += 1;
            } else {
                // Moved to another region or still in transit.
                scheduler.retry_entity_task(task);
            }
        }

        scheduler.simulation().tick(&mut ctx);

        let outbound = mem::take(&mut ctx.data().outbound);
        if !outbound.is_empty() {
            scheduler.packet_sink().flush(self.id(), outbound);
        }

        let stats = ctx.data().stats();
        drop(ctx);
        self.publish_stats(stats);

        let ended = Instant::now();
        let period = scheduler.config().tick_period();
        let overrun_streak = self.end_tick(tick, started, ended, period);
        let warn_after = scheduler.config().overrun_warn_ticks;
        if warn_after > 0 && overrun_streak > 0 && overrun_streak % warn_after == 0 {
            log::warn!(
                "Can't keep up! Region {} has been over its {}ms tick budget for {overrun_streak} \
                 ticks (last tick {}ms)",
                self.id(),
                period.as_millis(),
                (ended - started).as_millis()
            );
        }

        TickOutcome {
            tick,
            duration: ended - started,
            tasks_run,
            overrun_streak,
        }
    }

    fn halt(&self, scheduler: &RegionScheduler) {
        let _token = OwnershipToken::acquire(self);
        let queued = self.queue().close();
        let (retired, saves, homeless) = {
            let mut data = self.data.lock();
            let backlog = mem::take(&mut data.backlog);
            let delayed = data.delayed.drain_ordered();
            let entity_tasks = mem::take(&mut data.entity_tasks);
            let (saves, homeless) = data.take_all_for_save(scheduler.entities());
            ((backlog, delayed, entity_tasks), saves, homeless)
        };
        for entity in homeless {
            scheduler.strand_entity(entity);
        }
        let retired_count = queued.region_tasks.len()
            + queued.entity_tasks.len()
            + retired.0.len()
            + retired.1.len()
            + retired.2.len();
        // Retire callbacks run here, outside the data lock.
        drop(queued);
        drop(retired);

        let saved = saves.len();
        scheduler.chunks().save_blocking(saves);
        self.publish_stats(RegionStatsSnapshot::default());
        self.set_state(RegionState::Dead);
        log::debug!(
            "Region {} halted: saved {saved} chunks, retired {retired_count} tasks",
            self.id()
        );
    }
}
