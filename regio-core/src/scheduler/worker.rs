//! The loop run by every region tick thread.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use super::pool::{Next, ScheduleEntry};
use super::{CrashCause, CrashReport, RegionScheduler, crash_report};
use crate::region::{RegionState, Tickable};
use crate::token::{ThreadRole, set_thread_role};

pub(super) fn run(scheduler: &RegionScheduler) {
    set_thread_role(ThreadRole::TickWorker);
    loop {
        match scheduler.pool().next() {
            Next::Tick(entry) => run_entry(scheduler, entry),
            Next::Retire => {
                log::debug!("Idle region tick thread retiring");
                return;
            }
            Next::Stop => return,
        }
    }
}

fn run_entry(scheduler: &RegionScheduler, entry: ScheduleEntry) {
    let region = entry.region;
    if region.schedule.lock().epoch != entry.epoch {
        return;
    }
    // The global tick thread holds the claim while it merges or splits; it reschedules afterwards.
    if !region.try_claim() {
        return;
    }

    match region.state() {
        RegionState::Dead | RegionState::Merging | RegionState::Splitting => {
            scheduler.release(&region);
            return;
        }
        RegionState::ShuttingDown => {
            let halted = panic::catch_unwind(AssertUnwindSafe(|| region.halt(scheduler)));
            if let Err(payload) = halted {
                log::error!(
                    "Region {} panicked while halting: {}",
                    region.id(),
                    crash_report::panic_message(payload.as_ref())
                );
                region.set_state(RegionState::Dead);
            }
            scheduler.release(&region);
            scheduler.region_died();
            return;
        }
        RegionState::Starting | RegionState::Ticking => {}
    }
    region.cas_state(RegionState::Starting, RegionState::Ticking);

    let period = scheduler.config().tick_period();
    let deadline = Instant::now() + period;
    let ticked = panic::catch_unwind(AssertUnwindSafe(|| region.tick(scheduler, deadline)));

    let now = Instant::now();
    let mut next_start = entry.start + period;
    let max_behind = period * scheduler.config().max_catchup_ticks;
    if let Some(floor) = now.checked_sub(max_behind)
        && next_start < floor
    {
        next_start = floor;
    }

    match ticked {
        Ok(_) => {
            scheduler.release(&region);
            scheduler.pool().schedule(scheduler, &region, next_start);
        }
        Err(payload) => {
            let tick = region.current_tick() + 1;
            let report = CrashReport::for_region(
                &region,
                tick,
                CrashCause::Panic(crash_report::panic_message(payload.as_ref())),
            )
            .on_current_thread();
            region.clear_tick();
            scheduler.release(&region);
            scheduler.pool().schedule(scheduler, &region, next_start);
            scheduler.handle_crash(&report);
        }
    }
}
