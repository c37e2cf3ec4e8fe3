//! The elastic pool of region tick threads.
//!
//! Regions are not pinned to threads. Each scheduled region tick is an entry in a queue ordered by
//! start time; an idle worker takes the earliest entry once it is due and ticks that region. The
//! pool grows while due work finds no idle worker and shrinks again when workers stay idle.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regio_utils::locks::{SyncCondvar, SyncMutex};

use super::{RegionScheduler, worker};
use crate::region::RegionHandle;

pub(crate) struct ScheduleEntry {
    pub(crate) start: Instant,
    seq: u64,
    pub(crate) epoch: u64,
    pub(crate) region: RegionHandle,
}

impl PartialEq for ScheduleEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduleEntry {}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct PoolState {
    queue: BinaryHeap<Reverse<ScheduleEntry>>,
    next_seq: u64,
    workers: usize,
    idle: usize,
    next_worker_id: usize,
    stopping: bool,
}

pub(crate) enum Next {
    Tick(ScheduleEntry),
    Retire,
    Stop,
}

pub(crate) struct TickPool {
    state: SyncMutex<PoolState>,
    wake: SyncCondvar,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
}

impl TickPool {
    pub(crate) fn new(min_workers: usize, max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            state: SyncMutex::new(PoolState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                workers: 0,
                idle: 0,
                next_worker_id: 0,
                stopping: false,
            }),
            wake: SyncCondvar::new(),
            handles: SyncMutex::new(Vec::new()),
            min_workers: min_workers.max(1),
            max_workers: max_workers.max(min_workers).max(1),
            idle_timeout,
        }
    }

    /// Starts the minimum number of workers.
    pub(crate) fn start(&self, scheduler: &RegionScheduler) -> io::Result<()> {
        for _ in 0..self.min_workers {
            self.spawn_worker(scheduler)?;
        }
        Ok(())
    }

    fn spawn_worker(&self, scheduler: &RegionScheduler) -> io::Result<()> {
        let id = {
            let mut state = self.state.lock();
            state.workers += 1;
            state.next_worker_id += 1;
            state.next_worker_id
        };
        let scheduler = scheduler.clone();
        let spawned = thread::Builder::new()
            .name(format!("Region Tick Thread #{id}"))
            .spawn(move || worker::run(&scheduler));
        match spawned {
            Ok(handle) => {
                self.handles.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                self.state.lock().workers -= 1;
                Err(err)
            }
        }
    }

    /// Schedules the next tick of `region` at `start`. Any earlier entry for the region becomes
    /// stale.
    pub(crate) fn schedule(
        &self,
        scheduler: &RegionScheduler,
        region: &RegionHandle,
        start: Instant,
    ) {
        let epoch = {
            let mut schedule = region.schedule.lock();
            schedule.epoch += 1;
            schedule.next_start = start;
            schedule.epoch
        };
        let grow = {
            let mut state = self.state.lock();
            if state.stopping {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Reverse(ScheduleEntry {
                start,
                seq,
                epoch,
                region: region.clone(),
            }));
            state.idle == 0 && state.workers < self.max_workers
        };
        self.wake.notify_one();
        if grow && let Err(err) = self.spawn_worker(scheduler) {
            log::warn!("Failed to grow the region tick pool: {err}");
        }
    }

    /// Blocks until a region tick is due, the worker should retire, or the pool stops.
    pub(crate) fn next(&self) -> Next {
        let mut state = self.state.lock();
        state.idle += 1;
        let mut idle_since = Instant::now();
        let next = loop {
            if state.stopping {
                break Next::Stop;
            }
            let now = Instant::now();
            match state.queue.peek().map(|entry| entry.0.start) {
                Some(start) if start <= now => {
                    if let Some(Reverse(entry)) = state.queue.pop() {
                        break Next::Tick(entry);
                    }
                }
                Some(start) => {
                    self.wake.wait_until(&mut state, start);
                    idle_since = Instant::now();
                }
                None => {
                    let timed_out = self
                        .wake
                        .wait_for(&mut state, self.idle_timeout)
                        .timed_out();
                    if timed_out
                        && state.queue.is_empty()
                        && idle_since.elapsed() >= self.idle_timeout
                        && state.workers > self.min_workers
                    {
                        state.workers -= 1;
                        break Next::Retire;
                    }
                }
            }
        };
        state.idle -= 1;
        next
    }

    /// Number of live workers.
    pub(crate) fn worker_count(&self) -> usize {
        self.state.lock().workers
    }

    /// Stops every worker once it finishes its current tick, and waits for them.
    pub(crate) fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopping = true;
            state.queue.clear();
        }
        self.wake.notify_all();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("A region tick thread panicked while stopping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::iter;

    use super::*;
    use crate::region::{RegionData, RegionId};

    fn entry(start: Instant, seq: u64) -> ScheduleEntry {
        ScheduleEntry {
            start,
            seq,
            epoch: 0,
            region: RegionHandle::new(RegionId::next(), RegionData::new(0), start),
        }
    }

    #[test]
    fn test_earliest_start_pops_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(entry(now + Duration::from_millis(50), 0)));
        heap.push(Reverse(entry(now, 1)));
        heap.push(Reverse(entry(now, 2)));

        let order: Vec<u64> = iter::from_fn(|| heap.pop().map(|Reverse(e)| e.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_idle_pool_reports_stop() {
        let pool = TickPool::new(1, 1, Duration::from_millis(10));
        pool.state.lock().stopping = true;
        assert!(matches!(pool.next(), Next::Stop));
    }
}
