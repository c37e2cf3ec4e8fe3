//! The region scheduler.
//!
//! [`RegionScheduler`] owns the worker pool, the global tick thread and the watchdog, and is the
//! only way other subsystems get work onto a region. Work is submitted as one of four kinds of
//! task:
//!
//! - global tasks run on the global tick thread between region ticks;
//! - region tasks run on whichever worker ticks the target region next;
//! - chunk tasks load the columns around a position first, then run on their owner;
//! - entity tasks follow an entity across regions, retrying while it is between owners.
//!
//! Callers never need to know which thread owns what. Everything routes through the topology at
//! dispatch time and again at run time.

mod control;
mod crash_report;
mod pool;
mod services;
mod shutdown;
mod status;
mod stranded;
mod watchdog;
mod worker;

#[cfg(test)]
mod tests;

pub(crate) use control::ControlCommand;
pub use crash_report::{CrashCause, CrashReport};
pub use services::{FatalPolicy, Services};
pub use status::{RegionStatus, ServerStatus};
pub(crate) use stranded::hand_over;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::channel::{self, Sender};
use crossbeam::queue::SegQueue;
use futures::future;
use regio_utils::ChunkPos;
use regio_utils::locks::{SyncCondvar, SyncMutex, SyncRwLock};
use tokio::runtime::{self, Runtime};
use uuid::Uuid;

use crate::chunk::{ChunkHolderManager, ChunkLevel, ChunkLoadFuture, TicketType};
use crate::config::SchedulerConfig;
use crate::entity::{EntityDirectory, EntityRef};
use crate::error::{ScheduleError, StartError};
use crate::network::{InboundPacket, PacketSink};
use crate::region::{EntityHandle, RegionContext, RegionHandle, RegionId};
use crate::regionizer::{RegionMap, Topology};
use crate::simulation::RegionSimulation;
use crate::task::{EntityTask, GlobalTask, RegionTask, RetireFn, RetryPolicy, ScheduledTask};
use crate::ticks::{TaskPriority, TickReport, TickTimes};
use pool::TickPool;
use stranded::StrandedEntities;

/// Where a region task should run.
#[derive(Debug, Clone)]
pub enum RegionHint {
    /// A specific region. If it is merged away the task follows the survivor.
    Region(RegionHandle),
    /// Whichever region owns the column. The column is loaded first if no region owns it.
    Chunk(ChunkPos),
}

impl From<ChunkPos> for RegionHint {
    fn from(pos: ChunkPos) -> Self {
        Self::Chunk(pos)
    }
}

impl From<RegionHandle> for RegionHint {
    fn from(region: RegionHandle) -> Self {
        Self::Region(region)
    }
}

/// The columns a chunk task needs loaded before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTaskSpec {
    /// The column the task is anchored to.
    pub pos: ChunkPos,
    /// Chebyshev radius, in columns, around `pos` that must be loaded.
    pub radius: i32,
    /// Level the columns must reach.
    pub level: ChunkLevel,
}

impl ChunkTaskSpec {
    /// Describes a chunk task.
    #[must_use]
    pub const fn new(pos: ChunkPos, radius: i32, level: ChunkLevel) -> Self {
        Self { pos, radius, level }
    }
}

/// What a global task sees.
pub struct GlobalContext<'a> {
    scheduler: &'a RegionScheduler,
    tick: u64,
}

impl<'a> GlobalContext<'a> {
    pub(crate) const fn new(scheduler: &'a RegionScheduler, tick: u64) -> Self {
        Self { scheduler, tick }
    }

    /// The scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &RegionScheduler {
        self.scheduler
    }

    /// The global tick counter.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }
}

pub(crate) struct SchedulerShared {
    config: SchedulerConfig,
    services: Services,
    topology: Arc<SyncRwLock<Topology>>,
    chunks: Arc<ChunkHolderManager>,
    entities: EntityDirectory,
    pool: TickPool,
    control: Sender<ControlCommand>,
    global_tick: Arc<AtomicU64>,
    global_tasks: SegQueue<GlobalTask>,
    entity_retries: SegQueue<EntityTask>,
    stranded: StrandedEntities,
    retry: RetryPolicy,
    status: ArcSwap<ServerStatus>,
    status_dirty: AtomicBool,
    global_times: SyncMutex<TickTimes>,
    global_tick_started: SyncMutex<Option<Instant>>,
    live_regions: AtomicUsize,
    release_lock: SyncMutex<()>,
    release_signal: SyncCondvar,
    halting: AtomicBool,
    halt_started: AtomicBool,
    halted: SyncMutex<bool>,
    halted_signal: SyncCondvar,
    watchdog_stop: SyncMutex<bool>,
    watchdog_signal: SyncCondvar,
    io_runtime: SyncMutex<Option<Runtime>>,
    threads: SyncMutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running scheduler. Cheap to clone; all clones drive the same scheduler.
///
/// Threads keep running until [`RegionScheduler::halt`] is called, even if every handle is
/// dropped.
#[derive(Clone)]
pub struct RegionScheduler(Arc<SchedulerShared>);

impl RegionScheduler {
    /// Validates `config`, starts the chunk I/O runtime, the worker pool, the global tick thread
    /// and the watchdog.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a thread could not be spawned.
    pub fn start(config: SchedulerConfig, services: Services) -> Result<Self, StartError> {
        config.validate()?;

        let io_runtime = runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("Chunk IO Thread")
            .enable_all()
            .build()?;
        let io = io_runtime.handle().clone();
        let (control, commands) = channel::unbounded();
        let topology = Arc::new(SyncRwLock::new(Topology::new(RegionMap::from_config(
            &config,
        ))));
        let global_tick = Arc::new(AtomicU64::new(0));
        let chunks = Arc::new(ChunkHolderManager::new(
            &config,
            services.storage.clone(),
            services.generator.clone(),
            io,
            control.clone(),
            topology.clone(),
            global_tick.clone(),
        ));
        let pool = TickPool::new(
            config.resolved_tick_threads(),
            config.resolved_max_tick_threads(),
            Duration::from_millis(config.idle_worker_timeout_ms),
        );

        let scheduler = Self(Arc::new(SchedulerShared {
            retry: RetryPolicy::from_config(&config),
            config,
            services,
            topology,
            chunks,
            entities: EntityDirectory::default(),
            pool,
            control,
            global_tick,
            global_tasks: SegQueue::new(),
            entity_retries: SegQueue::new(),
            stranded: StrandedEntities::default(),
            status: ArcSwap::from_pointee(ServerStatus::empty()),
            status_dirty: AtomicBool::new(true),
            global_times: SyncMutex::new(TickTimes::default()),
            global_tick_started: SyncMutex::new(None),
            live_regions: AtomicUsize::new(0),
            release_lock: SyncMutex::new(()),
            release_signal: SyncCondvar::new(),
            halting: AtomicBool::new(false),
            halt_started: AtomicBool::new(false),
            halted: SyncMutex::new(false),
            halted_signal: SyncCondvar::new(),
            watchdog_stop: SyncMutex::new(false),
            watchdog_signal: SyncCondvar::new(),
            io_runtime: SyncMutex::new(Some(io_runtime)),
            threads: SyncMutex::new(Vec::new()),
        }));

        if let Err(err) = scheduler.spawn_threads(commands) {
            scheduler.0.pool.stop();
            *scheduler.0.watchdog_stop.lock() = true;
            scheduler.0.watchdog_signal.notify_all();
            let _ = scheduler.0.control.send(ControlCommand::Stop);
            return Err(err.into());
        }

        log::info!(
            "Region scheduler started: {} TPS, {} tick threads (up to {}), sections of {}x{} \
             chunks",
            scheduler.0.config.tick_rate,
            scheduler.0.pool.worker_count(),
            scheduler.0.config.resolved_max_tick_threads(),
            1 << scheduler.0.config.section_shift,
            1 << scheduler.0.config.section_shift,
        );
        Ok(scheduler)
    }

    fn spawn_threads(
        &self,
        commands: channel::Receiver<ControlCommand>,
    ) -> io::Result<()> {
        self.0.pool.start(self)?;

        let scheduler = self.clone();
        let control = thread::Builder::new()
            .name("Global Tick Thread".to_owned())
            .spawn(move || control::run(&scheduler, &commands))?;
        self.0.threads.lock().push(control);

        let scheduler = self.clone();
        let watchdog = thread::Builder::new()
            .name("Region Watchdog".to_owned())
            .spawn(move || watchdog::run(&scheduler))?;
        self.0.threads.lock().push(watchdog);
        Ok(())
    }

    /// The configuration the scheduler runs with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.0.config
    }

    /// The chunk holder table.
    #[must_use]
    pub fn chunks(&self) -> &Arc<ChunkHolderManager> {
        &self.0.chunks
    }

    /// Live entities by UUID.
    #[must_use]
    pub fn entities(&self) -> &EntityDirectory {
        &self.0.entities
    }

    /// Looks up a live entity by UUID.
    #[must_use]
    pub fn entity(&self, uuid: &Uuid) -> Option<EntityRef> {
        self.0.entities.get(uuid)
    }

    pub(crate) fn simulation(&self) -> &dyn RegionSimulation {
        self.0.services.simulation.as_ref()
    }

    pub(crate) fn packet_sink(&self) -> &dyn PacketSink {
        self.0.services.packets.as_ref()
    }

    pub(crate) fn pool(&self) -> &TickPool {
        &self.0.pool
    }

    /// The region owning a loaded column.
    #[must_use]
    pub fn resolve_owner(&self, pos: ChunkPos) -> Option<RegionHandle> {
        self.0.topology.read().owner(pos).cloned()
    }

    /// The region owning the section of `pos`, whether or not the column is loaded.
    pub(crate) fn section_owner(&self, pos: ChunkPos) -> Option<RegionHandle> {
        let topology = self.0.topology.read();
        let section = topology.map.section_of(pos);
        topology.owner_of_section(section).cloned()
    }

    /// A live region by id.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<RegionHandle> {
        self.0.topology.read().region(id).cloned()
    }

    /// Every live region.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionHandle> {
        self.0.topology.read().regions().cloned().collect()
    }

    /// Number of regions that have not died yet.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.0.live_regions.load(Ordering::Acquire)
    }

    /// The global tick counter.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.0.global_tick.load(Ordering::Acquire)
    }

    /// Whether halting has begun.
    #[must_use]
    pub fn is_halting(&self) -> bool {
        self.0.halting.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<(), ScheduleError> {
        if self.is_halting() {
            Err(ScheduleError::SchedulerHalted)
        } else {
            Ok(())
        }
    }

    /// Runs `task` on the global tick thread after `delay` global ticks.
    ///
    /// # Errors
    /// Returns [`ScheduleError::SchedulerHalted`] once halting has begun.
    pub fn schedule_global<F>(&self, delay: u64, task: F) -> Result<(), ScheduleError>
    where
        F: FnOnce(&GlobalContext<'_>) + Send + 'static,
    {
        self.check_running()?;
        self.0.global_tasks.push(GlobalTask::once(delay, task));
        Ok(())
    }

    /// Runs `task` on the global tick thread every `period` global ticks, first after
    /// `initial_delay`.
    ///
    /// # Errors
    /// Returns [`ScheduleError::SchedulerHalted`] once halting has begun.
    pub fn run_global_at_fixed_rate<F>(
        &self,
        initial_delay: u64,
        period: u64,
        task: F,
    ) -> Result<ScheduledTask, ScheduleError>
    where
        F: FnMut(&GlobalContext<'_>) + Send + 'static,
    {
        self.check_running()?;
        let control = ScheduledTask::new(true);
        self.0.global_tasks.push(GlobalTask::repeating(
            initial_delay,
            period,
            control.clone(),
            task,
        ));
        Ok(control)
    }

    /// Runs `task` on a region after `delay` of that region's ticks.
    ///
    /// # Errors
    /// Returns [`ScheduleError::SchedulerHalted`] once halting has begun, and
    /// [`ScheduleError::RegionDead`] if the hinted region is gone.
    pub fn schedule_for_region<F>(
        &self,
        hint: RegionHint,
        delay: u64,
        task: F,
    ) -> Result<(), ScheduleError>
    where
        F: FnOnce(&mut RegionContext) + Send + 'static,
    {
        self.check_running()?;
        self.dispatch_region_task(hint, RegionTask::once(delay, task))
    }

    /// Runs `task` on a region every `period` of its ticks, first after `initial_delay`.
    ///
    /// The task stops when cancelled through the returned handle, or when its region dies without
    /// being absorbed by another.
    ///
    /// # Errors
    /// See [`RegionScheduler::schedule_for_region`].
    pub fn run_region_at_fixed_rate<F>(
        &self,
        hint: RegionHint,
        initial_delay: u64,
        period: u64,
        task: F,
    ) -> Result<ScheduledTask, ScheduleError>
    where
        F: FnMut(&mut RegionContext) + Send + 'static,
    {
        self.check_running()?;
        let control = ScheduledTask::new(true);
        let task =
            RegionTask::repeating(initial_delay, period, task).controlled_by(control.clone());
        self.dispatch_region_task(hint, task)?;
        Ok(control)
    }

    fn dispatch_region_task(
        &self,
        hint: RegionHint,
        task: RegionTask,
    ) -> Result<(), ScheduleError> {
        match hint {
            RegionHint::Region(region) => region
                .queue()
                .push_region(task)
                .map_err(|_| ScheduleError::RegionDead(region.id())),
            RegionHint::Chunk(pos) => {
                let task = task.anchored(pos);
                match self.section_owner(pos) {
                    Some(owner) => {
                        if let Err(task) = owner.queue().push_region(task) {
                            // Destroyed between the lookup and the push; wait for a new owner.
                            self.enqueue_after_load(pos, vec![self.request_border(pos)], task);
                        }
                    }
                    None => self.enqueue_after_load(pos, vec![self.request_border(pos)], task),
                }
                Ok(())
            }
        }
    }

    fn request_border(&self, pos: ChunkPos) -> ChunkLoadFuture {
        self.0
            .chunks
            .request_load(pos, ChunkLevel::Border, TaskPriority::Normal)
    }

    /// Loads every column within `spec.radius` of `spec.pos` to `spec.level`, then runs `task` on
    /// the region owning `spec.pos` after `delay` of its ticks.
    ///
    /// The columns stay loaded until the task has run or retired. If a column fails to load, or
    /// the task is rejected, `retire` runs instead.
    ///
    /// # Errors
    /// Returns [`ScheduleError::SchedulerHalted`] once halting has begun.
    ///
    /// # Panics
    /// Panics if the radius is negative or larger than a region is guaranteed to span around any
    /// loaded column ([`SchedulerConfig::max_task_radius`]).
    pub fn schedule_for_chunk<F>(
        &self,
        spec: ChunkTaskSpec,
        delay: u64,
        task: F,
        retire: Option<RetireFn>,
    ) -> Result<(), ScheduleError>
    where
        F: FnOnce(&mut RegionContext) + Send + 'static,
    {
        let max_radius = self.0.config.max_task_radius();
        assert!(
            (0..=max_radius).contains(&spec.radius),
            "chunk task radius {} around {} is outside 0..={max_radius}",
            spec.radius,
            spec.pos
        );
        let task = RegionTask::once(delay, task)
            .anchored(spec.pos)
            .retired_by(retire);
        // Dropping the task here retires it.
        self.check_running()?;

        let chunks = &self.0.chunks;
        let mut tickets = Vec::new();
        let mut loads = Vec::new();
        for pos in spec.pos.square(spec.radius) {
            tickets.push(chunks.add_ticket_guarded(pos, TicketType::PendingTask, spec.level));
            loads.push(chunks.load_future(pos));
        }
        self.enqueue_after_load(spec.pos, loads, task.holding(tickets));
        Ok(())
    }

    fn enqueue_after_load(&self, anchor: ChunkPos, loads: Vec<ChunkLoadFuture>, task: RegionTask) {
        let scheduler = self.clone();
        self.0.chunks.spawn_tracked(async move {
            let results = future::join_all(loads).await;
            if let Some(err) = results.iter().find_map(|result| result.as_ref().err()) {
                log::debug!("Retiring task for chunk {anchor}: {err}");
                return;
            }
            match scheduler.section_owner(anchor) {
                Some(owner) => {
                    if let Err(task) = owner.queue().push_region(task) {
                        log::debug!("Retiring task for chunk {anchor}: its region just died");
                        drop(task);
                    }
                }
                None => log::debug!("Retiring task for chunk {anchor}: no region owns it"),
            }
        });
    }

    /// Runs `task` on whichever region owns `entity` after `delay` of that region's ticks.
    ///
    /// While the entity is between regions the task is retried every
    /// [`SchedulerConfig::retry_interval_ticks`] global ticks, up to the configured attempt limit,
    /// after which `retire` runs. If the entity is removed before the task runs, `retire` runs.
    ///
    /// Returns `false`, without running or retiring anything, if the entity is already removed or
    /// halting has begun.
    pub fn schedule_for_entity<F>(
        &self,
        entity: &EntityRef,
        delay: u64,
        task: F,
        retire: Option<RetireFn>,
    ) -> bool
    where
        F: FnOnce(EntityHandle<'_>) + Send + 'static,
    {
        if entity.is_removed() || self.is_halting() {
            return false;
        }
        let task = EntityTask::new(entity.clone(), delay, Box::new(task), retire);
        if let Err(task) = self.dispatch_entity_task(task) {
            self.0.entity_retries.push(task);
        }
        true
    }

    pub(crate) fn dispatch_entity_task(&self, task: EntityTask) -> Result<(), EntityTask> {
        let entity = task.entity();
        if entity.is_in_transit() {
            return Err(task);
        }
        match self.resolve_owner(entity.chunk_pos()) {
            Some(owner) => owner.queue().push_entity(task),
            None => Err(task),
        }
    }

    /// Hands a task whose entity was not where expected to the global tick thread for another
    /// attempt.
    pub(crate) fn retry_entity_task(&self, task: EntityTask) {
        self.0.entity_retries.push(task);
    }

    /// Delivers an inbound packet to the region owning `player`.
    ///
    /// Returns `false` if the player is already gone.
    pub fn deliver_packet<F>(&self, player: &EntityRef, packet: InboundPacket, handler: F) -> bool
    where
        F: FnOnce(EntityHandle<'_>, InboundPacket) + Send + 'static,
    {
        let id = packet.id;
        let uuid = player.uuid();
        self.schedule_for_entity(
            player,
            0,
            move |entity| handler(entity, packet),
            Some(Box::new(move || {
                log::trace!("Dropping inbound packet {id} for {uuid}: the player is gone");
            })),
        )
    }

    /// Forces the status snapshot to be rebuilt on the next global tick.
    pub fn invalidate_status(&self) {
        self.0.status_dirty.store(true, Ordering::Release);
    }

    /// The latest status snapshot.
    #[must_use]
    pub fn status(&self) -> Arc<ServerStatus> {
        self.0.status.load_full()
    }

    /// Rolling timings of the global tick over `window`.
    #[must_use]
    pub fn global_tick_report(&self, window: Duration) -> TickReport {
        self.0.global_times.lock().report(Instant::now(), window)
    }

    /// How long the global tick in progress has been running, if one is.
    #[must_use]
    pub fn global_running_for(&self) -> Option<Duration> {
        self.0
            .global_tick_started
            .lock()
            .map(|started| started.elapsed())
    }

    /// Gives a region back after exclusive use and wakes anyone waiting to claim it.
    pub(crate) fn release(&self, region: &RegionHandle) {
        region.release();
        let _guard = self.0.release_lock.lock();
        self.0.release_signal.notify_all();
    }

    /// Takes a region's claim, waiting for its current tick to finish.
    pub(crate) fn claim_blocking(&self, region: &RegionHandle) {
        let mut guard = self.0.release_lock.lock();
        while !region.try_claim() {
            self.0
                .release_signal
                .wait_for(&mut guard, Duration::from_millis(5));
        }
    }

    pub(crate) fn region_created(&self) {
        self.0.live_regions.fetch_add(1, Ordering::AcqRel);
        self.invalidate_status();
    }

    pub(crate) fn region_died(&self) {
        self.0.live_regions.fetch_sub(1, Ordering::AcqRel);
        self.invalidate_status();
        let _guard = self.0.release_lock.lock();
        self.0.release_signal.notify_all();
    }

    /// Logs a crash report and applies the fatal policy.
    pub(crate) fn handle_crash(&self, report: &CrashReport) {
        report.log();
        match &self.0.services.fatal {
            FatalPolicy::ExitProcess { code } => FatalPolicy::exit_process(*code),
            FatalPolicy::HaltScheduler => self.halt(false),
            FatalPolicy::Custom(handler) => handler(report),
        }
    }
}
