//! Detects ticks that run far past their budget.
//!
//! The watchdog samples how long every in-progress tick has been running. Past `warn_after_ms` it
//! logs a warning, repeated every `warn_interval_ms`. Past `crash_after_ms` it files a crash report
//! and applies the fatal policy, once per stuck tick.

use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use super::control::global_crash_report;
use super::{CrashCause, CrashReport, RegionScheduler};
use crate::region::{RegionHandle, RegionId};

pub(super) fn run(scheduler: &RegionScheduler) {
    let config = scheduler.config();
    let interval = Duration::from_millis(config.watchdog_interval_ms.max(1));
    let warn_after = Duration::from_millis(config.warn_after_ms);
    let warn_interval = Duration::from_millis(config.warn_interval_ms);
    let crash_after = Duration::from_millis(config.crash_after_ms);

    let mut last_warned: FxHashMap<RegionId, Instant> = FxHashMap::default();
    let mut reported: FxHashSet<RegionId> = FxHashSet::default();

    loop {
        {
            let mut stop = scheduler.0.watchdog_stop.lock();
            if !*stop {
                scheduler.0.watchdog_signal.wait_for(&mut stop, interval);
            }
            if *stop {
                break;
            }
        }

        let now = Instant::now();
        let mut running: Vec<(RegionId, Option<RegionHandle>, Duration)> = Vec::new();
        if let Some(elapsed) = scheduler.global_running_for() {
            running.push((RegionId::GLOBAL, None, elapsed));
        }
        // A stuck global tick may hold the topology; fall back to checking it alone.
        if let Some(topology) = scheduler.0.topology.try_read_for(interval) {
            for region in topology.regions() {
                if let Some(elapsed) = region.running_for() {
                    running.push((region.id(), Some(region.clone()), elapsed));
                }
            }
        }

        let running_ids: FxHashSet<RegionId> = running.iter().map(|(id, _, _)| *id).collect();
        reported.retain(|id| running_ids.contains(id));
        last_warned.retain(|id, _| running_ids.contains(id));

        for (id, region, elapsed) in running {
            if elapsed >= crash_after {
                if reported.insert(id) {
                    let report = match &region {
                        Some(region) => CrashReport::for_region(
                            region,
                            region.current_tick() + 1,
                            CrashCause::Stuck,
                        ),
                        None => global_crash_report(scheduler, CrashCause::Stuck),
                    };
                    scheduler.handle_crash(&report);
                }
                continue;
            }
            if elapsed >= warn_after
                && last_warned
                    .get(&id)
                    .is_none_or(|last| now.duration_since(*last) >= warn_interval)
            {
                last_warned.insert(id, now);
                let name = if id == RegionId::GLOBAL {
                    "the global tick".to_owned()
                } else {
                    format!("region {id}")
                };
                log::warn!(
                    "A tick of {name} has been running for {}ms (crash report at {}ms)",
                    elapsed.as_millis(),
                    crash_after.as_millis()
                );
            }
        }
    }
    log::debug!("Region watchdog stopped");
}
