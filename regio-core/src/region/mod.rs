//! Regions: independently ticking partitions of the world.
//!
//! A [`Region`] owns a set of loaded chunk columns and the entities inside them. Its data may only
//! be touched by the thread that currently holds the region's claim, which is either the worker
//! ticking it or the global tick thread while it merges, splits or destroys the region.

mod context;
mod data;
mod tick;

pub use context::{EntityHandle, RegionContext};
pub(crate) use data::RegionData;
pub use tick::{TickOutcome, Tickable};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use regio_utils::locks::SyncMutex;

use crate::task::RegionTaskQueue;
use crate::ticks::{TickReport, TickTimes};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a region for its whole life. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u64);

impl RegionId {
    /// Reserved for the global tick.
    pub const GLOBAL: Self = Self(0);

    pub(crate) fn next() -> Self {
        Self(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a region.
///
/// `Starting -> Ticking -> {Ticking, Merging, Splitting} -> ShuttingDown -> Dead`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionState {
    /// Created, first tick not run yet.
    Starting,
    /// Ticking normally.
    Ticking,
    /// Being merged into or absorbing another region.
    Merging,
    /// Being partitioned.
    Splitting,
    /// Will save and stop at its next turn.
    ShuttingDown,
    /// Absorbed, destroyed or halted. Never ticks again.
    Dead,
}

impl RegionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Ticking,
            2 => Self::Merging,
            3 => Self::Splitting,
            4 => Self::ShuttingDown,
            _ => Self::Dead,
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Ticking => "ticking",
            Self::Merging => "merging",
            Self::Splitting => "splitting",
            Self::ShuttingDown => "shutting down",
            Self::Dead => "dead",
        })
    }
}

/// Counts published by a region after every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStatsSnapshot {
    /// Loaded chunk columns.
    pub chunks: usize,
    /// Entities, players included.
    pub entities: usize,
    /// Entities with a connection.
    pub players: usize,
}

#[derive(Debug, Default)]
struct RegionStats {
    chunks: AtomicUsize,
    entities: AtomicUsize,
    players: AtomicUsize,
}

pub(crate) struct TickSchedule {
    pub(crate) next_start: Instant,
    pub(crate) epoch: u64,
}

/// The shared part of a region. Always used through a [`RegionHandle`].
pub struct Region {
    id: RegionId,
    state: AtomicU8,
    busy: AtomicBool,
    pub(crate) data: Arc<SyncMutex<RegionData>>,
    queue: RegionTaskQueue,
    stats: RegionStats,
    times: SyncMutex<TickTimes>,
    pub(crate) schedule: SyncMutex<TickSchedule>,
    tick_started: SyncMutex<Option<Instant>>,
    last_tick: AtomicU64,
    overrun_streak: AtomicU32,
}

/// A cheap, shareable reference to a region.
///
/// Holding a handle does not grant access to the region's data; only its [`RegionContext`] does.
#[derive(Clone)]
pub struct RegionHandle(Arc<Region>);

impl RegionHandle {
    pub(crate) fn new(id: RegionId, data: RegionData, next_start: Instant) -> Self {
        let last_tick = data.tick;
        Self(Arc::new(Region {
            id,
            state: AtomicU8::new(RegionState::Starting as u8),
            busy: AtomicBool::new(false),
            data: Arc::new(SyncMutex::new(data)),
            queue: RegionTaskQueue::new(),
            stats: RegionStats::default(),
            times: SyncMutex::new(TickTimes::new(TickTimes::LONG_WINDOW)),
            schedule: SyncMutex::new(TickSchedule {
                next_start,
                epoch: 0,
            }),
            tick_started: SyncMutex::new(None),
            last_tick: AtomicU64::new(last_tick),
            overrun_streak: AtomicU32::new(0),
        }))
    }
}

impl Deref for RegionHandle {
    type Target = Region;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for RegionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RegionHandle {}

impl Hash for RegionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Region {
    /// The region's id.
    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the region will never tick again.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state() == RegionState::Dead
    }

    pub(crate) fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn cas_state(&self, from: RegionState, to: RegionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes the exclusive right to touch the region's data.
    pub(crate) fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Whether a thread currently holds the region.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) const fn queue(&self) -> &RegionTaskQueue {
        &self.queue
    }

    /// Tasks submitted from other threads that the region has not picked up yet.
    #[must_use]
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// The region's tick counter as of its last completed tick.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Acquire)
    }

    /// Counts as of the last completed tick.
    #[must_use]
    pub fn stats(&self) -> RegionStatsSnapshot {
        RegionStatsSnapshot {
            chunks: self.stats.chunks.load(Ordering::Relaxed),
            entities: self.stats.entities.load(Ordering::Relaxed),
            players: self.stats.players.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn publish_stats(&self, stats: RegionStatsSnapshot) {
        self.stats.chunks.store(stats.chunks, Ordering::Relaxed);
        self.stats.entities.store(stats.entities, Ordering::Relaxed);
        self.stats.players.store(stats.players, Ordering::Relaxed);
    }

    /// Rolling timings over `window`.
    #[must_use]
    pub fn tick_report(&self, window: Duration) -> TickReport {
        self.times.lock().report(Instant::now(), window)
    }

    pub(crate) fn absorb_times(&self, other: &Self) {
        let other = other.times.lock();
        self.times.lock().absorb(&other);
    }

    /// How long the tick in progress has been running, if one is.
    #[must_use]
    pub fn running_for(&self) -> Option<Duration> {
        self.tick_started.lock().map(|started| started.elapsed())
    }

    pub(crate) fn begin_tick(&self, started: Instant) {
        *self.tick_started.lock() = Some(started);
    }

    /// Forgets a tick that never finished.
    pub(crate) fn clear_tick(&self) {
        *self.tick_started.lock() = None;
    }

    /// Records a finished tick. Returns the number of consecutive ticks that overran `period`.
    pub(crate) fn end_tick(
        &self,
        tick: u64,
        started: Instant,
        ended: Instant,
        period: Duration,
    ) -> u32 {
        *self.tick_started.lock() = None;
        self.last_tick.store(tick, Ordering::Release);
        self.times.lock().record(started, ended);
        if ended - started > period {
            self.overrun_streak.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.overrun_streak.store(0, Ordering::Relaxed);
            0
        }
    }
}
